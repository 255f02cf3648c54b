use std::collections::HashSet;

use chrono::{Duration, Utc};
use komento_api::{EntityType, Mention, Time, UserId, Uuid};
use rand::{seq::SliceRandom, Rng};

const NUM_USERS: usize = 8;
const NUM_POSTS: usize = 10;
const NUM_REELS: usize = 5;

const NUM_COMMENTS_PER_TYPE: usize = 200;
const REPLY_PROBABILITY: f64 = 0.4;
const MENTION_PROBABILITY: f64 = 0.2;
const COMMENT_WORD_COUNT: std::ops::Range<usize> = 3..40;

const NUM_LIKES_PER_TYPE: usize = 400;

/// Dates are spread over that many days before now
const HISTORY_DAYS: i64 = 30;

fn gen_n_items(table: &str, columns: &str, n: usize, mut f: impl FnMut(usize) -> String) {
    if n == 0 {
        return;
    }
    println!("INSERT INTO {} ({}) VALUES", table, columns);
    for i in 0..n {
        if i != 0 {
            println!(",");
        }
        print!("    {}", f(i));
    }
    println!();
    println!("ON CONFLICT DO NOTHING;");
}

fn sql_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn gen_date(rng: &mut impl Rng, after: Time) -> Time {
    let span = (Utc::now() - after).num_seconds().max(1);
    after + Duration::seconds(rng.gen_range(1..=span))
}

struct GenUser {
    id: Uuid,
    username: String,
}

struct GenComment {
    id: Uuid,
    entity: Uuid,
    author: Uuid,
    parent: Option<Uuid>,
    content: String,
    mentions: Vec<Mention>,
    created_at: Time,
    likes: i64,
    replies: i64,
}

fn gen_comments(
    rng: &mut impl Rng,
    users: &[GenUser],
    entities: &[(Uuid, Time)],
) -> Vec<GenComment> {
    let mut comments: Vec<GenComment> = Vec::with_capacity(NUM_COMMENTS_PER_TYPE);
    for _ in 0..NUM_COMMENTS_PER_TYPE {
        let author = &users[rng.gen_range(0..users.len())];
        // replies only go to top-level comments, and come after them
        let parent = match rng.gen_bool(REPLY_PROBABILITY) {
            true => comments
                .iter()
                .enumerate()
                .filter(|(_, c)| c.parent.is_none())
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
                .choose(rng)
                .copied(),
            false => None,
        };
        let (entity, after) = match parent {
            Some(p) => (comments[p].entity, comments[p].created_at),
            None => *entities
                .choose(rng)
                .expect("generating comments without entities"),
        };
        let mut content = lipsum::lipsum_words(rng.gen_range(COMMENT_WORD_COUNT));
        let mut mentions = Vec::new();
        if rng.gen_bool(MENTION_PROBABILITY) {
            let who = &users[rng.gen_range(0..users.len())];
            content = format!("@{} {}", who.username, content);
            mentions.push(Mention {
                user_id: UserId(who.id),
                username: who.username.clone(),
            });
        }
        if let Some(p) = parent {
            comments[p].replies += 1;
        }
        comments.push(GenComment {
            id: Uuid::new_v4(),
            entity,
            author: author.id,
            parent: parent.map(|p| comments[p].id),
            content,
            mentions,
            created_at: gen_date(rng, after),
            likes: 0,
            replies: 0,
        });
    }
    comments
}

fn gen_likes(
    rng: &mut impl Rng,
    users: &[GenUser],
    comments: &mut [GenComment],
) -> Vec<(Uuid, Uuid)> {
    let mut likes = HashSet::new();
    for _ in 0..NUM_LIKES_PER_TYPE {
        let c = rng.gen_range(0..comments.len());
        let u = users[rng.gen_range(0..users.len())].id;
        if likes.insert((comments[c].id, u)) {
            comments[c].likes += 1;
        }
    }
    likes.into_iter().collect()
}

fn gen_username(i: usize) -> String {
    let word = lipsum::lipsum_words(1).to_lowercase();
    let word = word.trim_matches(|c: char| !c.is_alphanumeric());
    format!("{word}{i}")
}

fn print_comments(t: EntityType, comments: &[GenComment], likes: &[(Uuid, Uuid)]) {
    gen_n_items(
        t.comment_table(),
        &format!(
            "id, {}, user_id, parent_comment_id, content, mentions, created_at, likes_count, replies_count",
            t.parent_column()
        ),
        comments.len(),
        |i| {
            let c = &comments[i];
            format!(
                "('{}', '{}', '{}', {}, {}, {}, '{}', {}, {})",
                c.id,
                c.entity,
                c.author,
                c.parent
                    .map(|p| format!("'{p}'"))
                    .unwrap_or_else(|| String::from("NULL")),
                sql_str(&c.content),
                sql_str(&serde_json::json!(c.mentions).to_string()),
                c.created_at.to_rfc3339(),
                c.likes,
                c.replies,
            )
        },
    );
    gen_n_items(t.like_table(), "comment_id, user_id", likes.len(), |i| {
        format!("('{}', '{}')", likes[i].0, likes[i].1)
    });
}

fn main() {
    let mut rng = rand::thread_rng();
    let start = Utc::now() - Duration::days(HISTORY_DAYS);

    // Generate users
    let users = (0..NUM_USERS)
        .map(|i| GenUser {
            id: Uuid::new_v4(),
            username: gen_username(i),
        })
        .collect::<Vec<_>>();
    gen_n_items("profiles", "id, username, avatar_url", users.len(), |i| {
        // leave some avatars unset, they get the default one
        let avatar = match i % 3 {
            0 => String::from("NULL"),
            _ => sql_str(&format!("https://avatars.invalid/{}.png", users[i].id)),
        };
        format!("('{}', {}, {})", users[i].id, sql_str(&users[i].username), avatar)
    });

    // Generate the entities comments attach to, then their comments
    for (t, n) in [(EntityType::Post, NUM_POSTS), (EntityType::Reel, NUM_REELS)] {
        let entities = (0..n)
            .map(|_| (Uuid::new_v4(), gen_date(&mut rng, start)))
            .collect::<Vec<_>>();
        gen_n_items(t.entity_table(), "id, user_id, created_at", n, |i| {
            format!(
                "('{}', '{}', '{}')",
                entities[i].0,
                users[i % users.len()].id,
                entities[i].1.to_rfc3339(),
            )
        });
        let mut comments = gen_comments(&mut rng, &users, &entities);
        let likes = gen_likes(&mut rng, &users, &mut comments);
        print_comments(t, &comments, &likes);
    }
}
