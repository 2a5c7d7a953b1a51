//! `@name` mentions: parsing them out of a message and resolving them to a persona.

use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;

use crate::scenario::Persona;

/// A message addressed to someone with `@name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    /// The token after `@`, as typed.
    pub name: String,
    /// The message with the mention removed.
    pub body: String,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Finds the first `@name` in `message`.
///
/// An `@` only opens a mention at the start of the message or after
/// whitespace, so `cfo@acme.com` is not one. A bare `@` is skipped.
pub fn parse_mention(message: &str) -> Option<Mention> {
    let mut prev: Option<char> = None;
    for (at, c) in message.char_indices() {
        let opens = c == '@' && prev.is_none_or(char::is_whitespace);
        prev = Some(c);
        if !opens {
            continue;
        }
        let after = &message[at + 1..];
        let end = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
        let name = after[..end].trim_end_matches('.');
        if name.is_empty() {
            continue;
        }
        let body = format!("{}{}", &message[..at], &after[end..]);
        return Some(Mention {
            name: name.to_string(),
            body: body.trim().to_string(),
        });
    }
    None
}

/// Resolves a mention against `personas`.
///
/// Tried in order: exact id, case-insensitive full name (spaces and
/// underscores interchangeable), case-insensitive first name, substring of id
/// or name, and finally the best fuzzy score.
pub fn resolve<'a>(name: &str, personas: &[&'a Persona]) -> Option<&'a Persona> {
    if let Some(p) = personas.iter().find(|p| p.id == name) {
        return Some(*p);
    }

    let wanted = name.trim().to_lowercase().replace('_', " ");
    if wanted.is_empty() {
        return None;
    }
    if let Some(p) = personas.iter().find(|p| p.name.to_lowercase() == wanted) {
        return Some(*p);
    }
    if let Some(p) = personas
        .iter()
        .find(|p| p.first_name().to_lowercase() == wanted)
    {
        return Some(*p);
    }
    if let Some(p) = personas.iter().find(|p| {
        p.name.to_lowercase().contains(&wanted) || p.id.to_lowercase().replace('_', " ").contains(&wanted)
    }) {
        return Some(*p);
    }

    let matcher = SkimMatcherV2::default();
    personas
        .iter()
        .filter_map(|p| {
            let by_name = matcher.fuzzy_match(&p.name, &wanted);
            let by_id = matcher.fuzzy_match(&p.id, name);
            by_name.max(by_id).map(|score| (score, *p))
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, p)| p)
}
