use crate::errors::FetchError;
use crate::link::PageDocument;
use reqwest::Client;
use tracing::{event, instrument, Level};
use url::Url;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

const LOGIN_PATH: &str = "/login/index.php";
const COURSE_PATH: &str = "/course/view.php";

/// Hidden field newer portals put in the login form to guard against CSRF.
const LOGIN_TOKEN_FIELD: &str = "logintoken";

/// An http client bound to one portal. Cookies set by the portal are kept for
/// the lifetime of the session, so every request after [`Session::login`] is
/// authenticated.
#[derive(Debug, Clone)]
pub struct Session {
    root_url: String,
    client: Client,
}

impl Session {
    /// A session with an empty cookie jar.
    pub fn new(root_url: &str) -> Result<Self, FetchError> {
        let root_url = root_url.trim_end_matches('/').to_string();
        if let Err(e) = Url::parse(&root_url) {
            event!(Level::ERROR, "Error parsing root url: {}", &root_url);
            return Err(FetchError::InvalidUrl(format!("{root_url} ({e})")));
        }
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { root_url, client })
    }

    /// Signs in with the portal's login form.
    ///
    /// The portal answers a rejected login by sending the browser back to the
    /// login form, so a response that ends up there is treated as a failure.
    #[instrument(skip(password))]
    pub async fn login(root_url: &str, username: &str, password: &str) -> Result<Self, FetchError> {
        let session = Self::new(root_url)?;
        let login_url = session.login_url()?;

        let login_page = session.get_page(&login_url).await?;
        let login_token = PageDocument::parse(&login_page)
            .input_value(LOGIN_TOKEN_FIELD)
            .map(str::to_string);

        let mut form = vec![("username", username), ("password", password)];
        if let Some(token) = login_token.as_deref() {
            form.push((LOGIN_TOKEN_FIELD, token));
        }

        let response = session
            .client
            .post(login_url.as_str())
            .form(&form)
            .send()
            .await?
            .error_for_status()?;

        if response.url().path() == login_url.path() {
            event!(Level::ERROR, "Login rejected for {}", username);
            return Err(FetchError::LoginRejected(response.url().to_string()));
        }
        event!(Level::INFO, "Logged in as {}", username);
        Ok(session)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn login_url(&self) -> Result<Url, FetchError> {
        self.portal_url(LOGIN_PATH)
    }

    /// Landing page of a course, where crawling starts.
    pub fn course_url(&self, course_id: u64) -> Result<Url, FetchError> {
        self.portal_url(&format!("{COURSE_PATH}?id={course_id}"))
    }

    fn portal_url(&self, path: &str) -> Result<Url, FetchError> {
        let link = format!("{}{}", self.root_url, path);
        Url::parse(&link).map_err(|e| FetchError::InvalidUrl(format!("{link} ({e})")))
    }

    /// Fetches a page's html.
    pub async fn get_page(&self, url: &Url) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}
