//! redb table definitions for the metadata store.
//!
//! Every table uses `&str` keys of the form `{namespace}/{name}` and
//! `&[u8]` values holding the JSON-serialized definition.

use redb::TableDefinition;

/// Function definitions.
pub const FUNCTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("functions");

/// Environment definitions.
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

/// HTTP trigger definitions.
pub const HTTP_TRIGGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("http_triggers");
