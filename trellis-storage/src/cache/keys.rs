//! Deterministic cache keys.
//!
//! Every key starts with the entity's cache prefix. Free-form values are
//! percent-escaped so they can never forge a segment separator, and every
//! set-valued input is sorted before joining. Two filter specs that mean
//! the same thing always produce the same key.

use std::collections::BTreeSet;

use trellis_core::{Entity, FilterSpec, Identifier};

/// Segment separator.
const SEP: char = ':';

/// Builds cache keys and invalidation patterns for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyBuilder {
    prefix: String,
}

impl CacheKeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: escape_segment(&prefix.into()),
        }
    }

    /// Builder keyed by [`Entity::cache_prefix`].
    pub fn for_entity_type<E: Entity>() -> Self {
        Self::new(E::cache_prefix())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key for a filtered list read.
    ///
    /// Layout: `prefix:filters:search=..:limit=..:offset=..:sort=field:dir`
    /// followed by `include=`, `rel=` and `field=` segments when present.
    pub fn for_filters(&self, spec: &FilterSpec) -> String {
        let mut segments = vec![self.prefix.clone(), "filters".to_string()];

        segments.push(format!(
            "search={}",
            spec.search_term.as_deref().map(escape_segment).unwrap_or_default()
        ));
        segments.push(format!("limit={}", spec.limit));
        segments.push(format!("offset={}", spec.offset));
        segments.push(format!(
            "sort={}{}{}",
            spec.sort_by.as_deref().map(escape_segment).unwrap_or_default(),
            SEP,
            spec.sort_direction
        ));

        if !spec.include_relations.is_empty() {
            segments.push(format!("include={}", join_sorted(&spec.include_relations)));
        }

        for (relation, ids) in &spec.relation_filters {
            let ids: BTreeSet<String> = ids.iter().map(canonical_id).collect();
            segments.push(format!(
                "rel={}={}",
                escape_segment(relation),
                join_sorted(&ids)
            ));
        }

        for (column, value) in &spec.field_filters {
            segments.push(format!(
                "field={}={}",
                escape_segment(column),
                escape_segment(&value.to_string())
            ));
        }

        segments.join(&SEP.to_string())
    }

    /// Key for a single-entity read: `prefix:id` or `prefix:id:a,b`.
    pub fn for_entity<I, S>(&self, id: &Identifier, relations: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let relations: BTreeSet<String> = relations
            .into_iter()
            .map(|r| r.as_ref().to_string())
            .collect();
        let base = format!("{}{}{}", self.prefix, SEP, id_segment(id));
        if relations.is_empty() {
            base
        } else {
            format!("{}{}{}", base, SEP, join_sorted(&relations))
        }
    }

    /// Key for a paged list addressed by an arbitrary identifier.
    pub fn for_list(&self, identifier: &str, limit: u32, offset: u32) -> String {
        format!(
            "{prefix}{s}list{s}{id}{s}{limit}{s}{offset}",
            prefix = self.prefix,
            s = SEP,
            id = escape_segment(identifier),
            limit = limit,
            offset = offset,
        )
    }

    /// Pattern matching every relation-qualified variant of one entity key.
    ///
    /// Also matches keys of ids sharing this id as a prefix (`4` covers
    /// `42`); those entries are simply re-read.
    pub fn entity_pattern(&self, id: &Identifier) -> String {
        format!(
            "{}*",
            escape_glob(&format!("{}{}{}", self.prefix, SEP, id_segment(id)))
        )
    }

    /// Pattern matching every filtered list key.
    pub fn filters_pattern(&self) -> String {
        format!("{}{}filters*", escape_glob(&self.prefix), SEP)
    }

    /// Pattern matching every relation-keyed list key.
    pub fn list_pattern(&self) -> String {
        format!("{}{}list*", escape_glob(&self.prefix), SEP)
    }

    /// Pattern matching every key of this entity type.
    pub fn all_pattern(&self) -> String {
        format!("{}{}*", escape_glob(&self.prefix), SEP)
    }
}

/// The value an id binds as, so `"007"` and `7` share a key, as do UUIDs
/// differing only in case.
pub fn canonical_id(id: &Identifier) -> String {
    match id {
        Identifier::Integer { value, .. } => value.to_string(),
        Identifier::UuidString(raw) => raw.to_lowercase(),
        Identifier::Opaque(raw) => raw.clone(),
    }
}

fn id_segment(id: &Identifier) -> String {
    escape_segment(&canonical_id(id))
}

fn join_sorted(values: &BTreeSet<String>) -> String {
    values
        .iter()
        .map(|v| escape_segment(v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Percent-escape the characters that carry meaning inside a key.
pub fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            ',' => out.push_str("%2C"),
            '=' => out.push_str("%3D"),
            other => out.push(other),
        }
    }
    out
}

/// Backslash-escape glob metacharacters so a literal matches only itself.
pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
