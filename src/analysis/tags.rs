//! Flag pattern tagging.

use crate::flow::{Direction, FlowEntry, FlowItem};
use regex::bytes::Regex;
use std::collections::BTreeSet;

pub const FLAG_IN: &str = "flag-in";
pub const FLAG_OUT: &str = "flag-out";

/// Compiled flag pattern. Build once and share; scanning takes `&self`.
#[derive(Debug, Clone)]
pub struct FlagTagger {
    pattern: Regex,
}

impl FlagTagger {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(FlagTagger {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Tags earned by `items`: `flag-in` for a match in client data,
    /// `flag-out` for a match in server data.
    pub fn scan(&self, items: &[FlowItem]) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        let (mut seen_in, mut seen_out) = (false, false);
        for item in items {
            let seen = match item.from {
                Direction::Client => &mut seen_in,
                Direction::Server => &mut seen_out,
            };
            if !*seen && self.pattern.is_match(&item.payload) {
                *seen = true;
            }
            if seen_in && seen_out {
                break;
            }
        }
        if seen_in {
            tags.insert(FLAG_IN.to_string());
        }
        if seen_out {
            tags.insert(FLAG_OUT.to_string());
        }
        tags
    }

    /// Add the flag tags for `entry`'s items to its tag set.
    pub fn tag(&self, entry: &mut FlowEntry) {
        for tag in self.scan(&entry.items) {
            entry.add_tag(&tag);
        }
    }
}
