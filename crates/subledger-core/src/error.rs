use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid duration for {key}: {value:?}")]
    InvalidDuration { key: &'static str, value: String },

    #[error("unable to read assets file {path}: {source}")]
    AssetsRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse assets file {path}: {source}")]
    AssetsParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("asset at index {0} missing {1}")]
    AssetsMissingField(usize, &'static str),
}

pub type Result<T> = std::result::Result<T, CoreError>;
