use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FetchError {
    #[error("Invalid url received : {0}")]
    InvalidUrl(String),
    #[error("error connecting to the portal. {0}")]
    NetworkError(String),
    #[error("server returned an error response. {url} => {status_code}")]
    ErrorStatusCode { status_code: String, url: String },
    /// parameters are file path, additional error message
    #[error("{message} : {file_name}")]
    FileOperationError { file_name: String, message: String },
    /// Parameter is the url the login attempt ended up on
    #[error("login was rejected by the portal, ended up at {0}")]
    LoginRejected(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => FetchError::ErrorStatusCode {
                status_code: status.to_string(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => FetchError::NetworkError(e.to_string()),
        }
    }
}
