//! Routing-key compilation.
//!
//! Translates application-level selectors into broker routing keys.
//! A key is three segments — event, uid class, uid path — joined by
//! `._.`. Publishing uses one literal key; queue bindings expand
//! wildcard (`**` → `#`), alternation (`|`) and optional-suffix (`^`)
//! patterns into the full set of binding keys the queue registers.
//!
//! Everything here is pure: the connection manager consumes the output,
//! nothing here touches the broker.

use crate::error::RiverError;

/// Joins the event, class, and path portions of a routing key.
pub const SEGMENT_DELIMITER: &str = "._.";

const MATCH_ALL: &str = "#";

/// An entity identifier of the form `class:path$oid`, e.g.
/// `post.event:feeds.bagera.concerts$123`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uid {
    class: String,
    path: String,
    oid: Option<String>,
}

impl Uid {
    /// Parse an identifier. The class and the `:` separator are
    /// required; the `$oid` suffix is optional.
    pub fn parse(input: &str) -> Result<Self, RiverError> {
        let (class, rest) = input
            .split_once(':')
            .ok_or_else(|| RiverError::InvalidUid(input.to_string()))?;
        if class.is_empty() {
            return Err(RiverError::InvalidUid(input.to_string()));
        }
        let (path, oid) = match rest.split_once('$') {
            Some((path, oid)) if !oid.is_empty() => (path, Some(oid.to_string())),
            Some((path, _)) => (path, None),
            None => (rest, None),
        };
        Ok(Self {
            class: class.to_string(),
            path: path.to_string(),
            oid,
        })
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn oid(&self) -> Option<&str> {
        self.oid.as_deref()
    }
}

/// A pattern for one routing-key position: either a single pattern
/// string or a list of alternatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    One(String),
    Any(Vec<String>),
}

impl Selector {
    /// Collapse to a single `|`-joined pattern string.
    fn pattern(&self) -> String {
        match self {
            Selector::One(pattern) => pattern.clone(),
            Selector::Any(alternatives) => alternatives.join("|"),
        }
    }
}

impl From<&str> for Selector {
    fn from(pattern: &str) -> Self {
        Selector::One(pattern.to_string())
    }
}

impl From<String> for Selector {
    fn from(pattern: String) -> Self {
        Selector::One(pattern)
    }
}

impl From<Vec<String>> for Selector {
    fn from(alternatives: Vec<String>) -> Self {
        Selector::Any(alternatives)
    }
}

impl From<Vec<&str>> for Selector {
    fn from(alternatives: Vec<&str>) -> Self {
        Selector::Any(alternatives.into_iter().map(str::to_string).collect())
    }
}

/// Compute the routing key a message is published with.
///
/// Both `event` and `uid` are required. The key is
/// `event ._. class ._. path` with empty segments dropped, never
/// padded.
pub fn publish_key(event: &str, uid: &str) -> Result<String, RiverError> {
    if event.is_empty() {
        return Err(RiverError::MissingArgument("event"));
    }
    if uid.is_empty() {
        return Err(RiverError::MissingArgument("uid"));
    }
    let uid = Uid::parse(uid)?;
    let segments: Vec<&str> = [event, uid.class(), uid.path()]
        .into_iter()
        .filter(|segment| !segment.is_empty())
        .collect();
    Ok(segments.join(SEGMENT_DELIMITER))
}

/// Compute the set of binding keys for the given selectors.
///
/// With no selectors at all the result is the single match-everything
/// key `#._.#._.#`. Otherwise each position expands independently —
/// missing positions to `#`, `**` rewritten to `#`, `|` splitting into
/// alternatives, and `^` in paths marking the start of an optional
/// suffix whose segments are appended one at a time:
///
/// ```
/// use river::routing::{binding_keys, Selector};
///
/// let path = Selector::from("feeds.bagera.^fb.concerts");
/// let keys = binding_keys(Some(&"create".into()), Some(&"post".into()), Some(&path));
/// assert_eq!(keys, vec![
///     "create._.post._.feeds.bagera",
///     "create._.post._.feeds.bagera.fb",
///     "create._.post._.feeds.bagera.fb.concerts",
/// ]);
/// ```
///
/// The result is the Cartesian product of all three expansions. No
/// ordering is guaranteed; callers must treat it as a set.
pub fn binding_keys(
    event: Option<&Selector>,
    class: Option<&Selector>,
    path: Option<&Selector>,
) -> Vec<String> {
    if event.is_none() && class.is_none() && path.is_none() {
        return vec![[MATCH_ALL; 3].join(SEGMENT_DELIMITER)];
    }

    let events = expand_element(event);
    let classes = expand_element(class);
    let paths = expand_path(path);

    let mut keys = Vec::with_capacity(events.len() * classes.len() * paths.len());
    for event in &events {
        for class in &classes {
            for path in &paths {
                keys.push(
                    [event.as_str(), class.as_str(), path.as_str()].join(SEGMENT_DELIMITER),
                );
            }
        }
    }
    keys
}

fn expand_element(selector: Option<&Selector>) -> Vec<String> {
    let pattern = match selector {
        Some(selector) => selector.pattern(),
        None => return vec![MATCH_ALL.to_string()],
    };
    pattern
        .replace("**", MATCH_ALL)
        .split('|')
        .map(str::to_string)
        .collect()
}

fn expand_path(selector: Option<&Selector>) -> Vec<String> {
    expand_element(selector)
        .iter()
        .flat_map(|alternative| expand_optional_suffix(alternative))
        .collect()
}

/// Expand a path pattern's `^` marker into the ladder of keys matching
/// zero or more of the optional trailing segments.
fn expand_optional_suffix(path: &str) -> Vec<String> {
    let Some((required, optional)) = path.split_once('^') else {
        return vec![path.to_string()];
    };
    let required: Vec<&str> = required.split('.').filter(|s| !s.is_empty()).collect();
    let optional: Vec<&str> = optional.split('.').filter(|s| !s.is_empty()).collect();
    (0..=optional.len())
        .map(|taken| {
            required
                .iter()
                .chain(optional[..taken].iter())
                .copied()
                .collect::<Vec<&str>>()
                .join(".")
        })
        .collect()
}
