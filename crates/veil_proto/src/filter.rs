//! Subscription filters.
//!
//! A filter matches an event when every populated field matches; empty
//! fields are wildcards. Recognized fields mirror the relay contract:
//! kinds, authors, `#d`, `#p`, and the `#l` label tag.

use serde::{Deserialize, Serialize};

use veil_crypto::PublicKey;

use crate::event::Event;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub d_tags: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<PublicKey>>,
    #[serde(rename = "#l", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author);
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors.get_or_insert_with(Vec::new).extend(authors);
        self
    }

    pub fn d_tag(mut self, d: impl Into<String>) -> Self {
        self.d_tags.get_or_insert_with(Vec::new).push(d.into());
        self
    }

    pub fn p_tag(mut self, p: PublicKey) -> Self {
        self.p_tags.get_or_insert_with(Vec::new).push(p);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(ref authors) = self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(ref d_tags) = self.d_tags {
            match event.tag_value("d") {
                Some(d) if d_tags.iter().any(|want| want == d) => {}
                _ => return false,
            }
        }
        if let Some(ref p_tags) = self.p_tags {
            let found = event
                .tag_values("p")
                .any(|p| p_tags.iter().any(|want| want.to_hex() == p));
            if !found {
                return false;
            }
        }
        if let Some(ref label) = self.label {
            match event.tag_value("l") {
                Some(l) if l == label => {}
                _ => return false,
            }
        }
        true
    }
}
