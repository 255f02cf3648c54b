use std::collections::HashMap;

use crate::{api::CommentId, Comment};

/// Turns a flat, chronologically ordered list of comments into a forest.
///
/// Every comment ends up exactly once in the result: under its parent if the
/// parent is in `flat`, at the top level otherwise. Sibling order is the input
/// order. Any `children` already present on the input are discarded.
pub fn build_tree(flat: Vec<Comment>) -> Vec<Comment> {
    let mut index = HashMap::with_capacity(flat.len());
    let mut nodes = Vec::with_capacity(flat.len());
    for mut c in flat {
        if index.contains_key(&c.id) {
            tracing::warn!(id = %c.id, "duplicate comment in flat list, keeping the first one");
            continue;
        }
        c.children.clear();
        index.insert(c.id, nodes.len());
        nodes.push(Some(c));
    }

    let mut children = vec![Vec::new(); nodes.len()];
    let mut roots = Vec::new();
    for (i, c) in nodes.iter().enumerate() {
        let parent = c
            .as_ref()
            .and_then(|c| c.parent_id)
            .and_then(|p| index.get(&p).copied())
            .filter(|p| *p != i);
        match parent {
            Some(p) => children[p].push(i),
            None => roots.push(i),
        }
    }

    let mut res = Vec::with_capacity(roots.len());
    for r in roots {
        res.extend(assemble(r, &mut nodes, &children));
    }
    // Whatever is left is only reachable through a parent cycle
    for i in 0..nodes.len() {
        if let Some(c) = assemble(i, &mut nodes, &children) {
            tracing::warn!(id = %c.id, "comment is part of a parent cycle, showing it at top level");
            res.push(c);
        }
    }
    res
}

fn assemble(i: usize, nodes: &mut [Option<Comment>], children: &[Vec<usize>]) -> Option<Comment> {
    let mut c = nodes[i].take()?;
    c.children = children[i]
        .iter()
        .filter_map(|&child| assemble(child, nodes, children))
        .collect();
    Some(c)
}

/// Parent of each comment in the forest, `None` for top-level ones
pub fn parent_map(tree: &[Comment]) -> HashMap<CommentId, Option<CommentId>> {
    fn walk(
        comments: &[Comment],
        parent: Option<CommentId>,
        res: &mut HashMap<CommentId, Option<CommentId>>,
    ) {
        for c in comments {
            res.insert(c.id, parent);
            walk(&c.children, Some(c.id), res);
        }
    }
    let mut res = HashMap::new();
    walk(tree, None, &mut res);
    res
}
