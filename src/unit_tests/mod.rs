/* Cross-cutting tests: fixture scenarios and relation-level properties. */

mod properties;
mod scenarios;
