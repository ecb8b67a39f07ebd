pub mod from_yaml;
pub mod lexer;

pub use from_yaml::{ConfigError, ConfigParser, FromYaml, ParseResult};
