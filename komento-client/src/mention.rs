use regex::Regex;

lazy_static::lazy_static! {
    // an `@` only starts a mention at the beginning of the text or after a
    // character that cannot be part of a username, so emails are skipped
    static ref MENTION: Regex = Regex::new(r"(?:^|[^A-Za-z0-9_.])@([A-Za-z0-9_.]+)")
        .expect("mention regex is valid");
}

/// Usernames referenced as `@username` in `content`, deduplicated, in order of first appearance
pub fn extract_mentions(content: &str) -> Vec<String> {
    let mut res: Vec<String> = Vec::new();
    for cap in MENTION.captures_iter(content) {
        let name = cap[1].trim_end_matches('.');
        if !name.is_empty() && !res.iter().any(|r| r == name) {
            res.push(String::from(name));
        }
    }
    res
}
