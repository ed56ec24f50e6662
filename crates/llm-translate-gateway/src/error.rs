use std::{io, path::PathBuf};

use thiserror::Error;
use toml_edit::{de::Error as TomlDeError, ser::Error as TomlSerError};
use url::ParseError as UrlParseError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("upstream base url cannot be empty")]
    BaseUrlEmpty,

    #[error("invalid upstream base url '{url}'")]
    BaseUrlInvalid {
        url: String,
        #[source]
        source: UrlParseError,
    },

    #[error("model name cannot be empty")]
    ModelNameEmpty,

    #[error("temperature {value} is outside the accepted range 0.0-2.0")]
    TemperatureOutOfRange { value: f64 },

    #[error("listening port cannot be 0")]
    PortZero,

    #[error("failed to create directory {path}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read config file {path}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write config file {path}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse TOML gateway config at {path}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: TomlDeError,
    },

    #[error("failed to serialise gateway settings to TOML")]
    SerialiseToml {
        #[source]
        source: TomlSerError,
    },

    #[error("failed to read glossary rules file {path}")]
    ReadRules {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to determine user home directory for LLM_GATEWAY_ROOT")]
    HomeDirectoryUnknown,
}
