//! Trellis Query - SQL Builder and Relation Extensions
//!
//! Builds SELECT statements as data, renders them to PostgreSQL text with
//! positional parameters, and adds join-table relation filters and
//! relation-count ordering through [`RelationQueryExt`].

pub mod builder;
pub mod extensions;

pub use builder::{
    escape_like, is_valid_identifier, OrderTerm, Predicate, RelatedMatch, RelatedRowsQuery,
    RelationCount, RelationSubquery, RenderedQuery, SelectQuery, OWNER_KEY, ROOT_ALIAS,
};
pub use extensions::RelationQueryExt;
