use crate::errors::FetchError;
use crate::session::Session;
use crate::CrawlRule;
use reqwest::header;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Name used when neither the server nor the url tell us anything about a
/// resource. Several such resources in one folder overwrite each other.
pub const FALLBACK_FILE_NAME: &str = "empty";

/// Longest file name, in bytes, most filesystems accept.
const MAX_FILE_NAME_BYTES: usize = 255;

/// Extensions longer than this are treated as part of the stem when shortening.
const MAX_EXTENSION_BYTES: usize = 16;

/// The query parameter the portal uses to identify a resource.
const RESOURCE_ID_PARAM: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub source_url: Url,
    pub resolved_filename: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded(PathBuf),
    /// The file was already present and no update was forced
    Skipped(PathBuf),
}

/// Returns false when the file is already there and the caller didn't ask
/// for a forced update. Only presence is checked, not size or age.
pub fn should_fetch(local_path: &Path, force_update: bool) -> bool {
    force_update || !local_path.exists()
}

/// Derives the local file name for a resource.
///
/// The resource id from the url is prefixed to the name the server suggests, as
/// several resources of a course may share a display name. When only one of the
/// two is known it's used on its own, and when neither is, [`FALLBACK_FILE_NAME`].
pub fn resolve_filename(disposition: &str, source_url: &str) -> String {
    let id = resource_id(source_url);
    let name = disposition_file_name(disposition);
    let file_name = match (id, name) {
        (Some(id), Some(name)) => format!("{id}_{name}"),
        (None, Some(name)) => name,
        (Some(id), None) => id,
        (None, None) => FALLBACK_FILE_NAME.to_string(),
    };
    sanitize_file_name(&file_name)
}

fn resource_id(source_url: &str) -> Option<String> {
    let url = Url::parse(source_url).ok()?;
    let id = url
        .query_pairs()
        .find(|(key, _)| key == RESOURCE_ID_PARAM)
        .map(|(_, value)| value.trim().to_string())?;
    (!id.is_empty()).then_some(id)
}

/// Reads the file name out of a `Content-Disposition` value, preferring the
/// RFC 5987 `filename*` form over plain `filename`.
fn disposition_file_name(disposition: &str) -> Option<String> {
    let params = disposition_params(disposition);
    let encoded = params
        .iter()
        .find(|(key, _)| key == "filename*")
        .and_then(|(_, value)| {
            // charset'language'percent-encoded-value
            let encoded = value.rsplit('\'').next()?;
            urlencoding::decode(encoded).ok().map(|v| v.into_owned())
        });
    encoded
        .or_else(|| {
            params
                .into_iter()
                .find(|(key, _)| key == "filename")
                .map(|(_, value)| value)
        })
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Splits `type; key=value; key="quoted; value"` into lowercase keys and
/// unquoted values. The disposition type itself is dropped.
fn disposition_params(disposition: &str) -> Vec<(String, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in disposition.chars() {
        match ch {
            _ if escaped => {
                current.push(ch);
                escaped = false;
            }
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .skip(1)
        .filter_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            Some((key.trim().to_lowercase(), value.trim().to_string()))
        })
        .collect()
}

/// Makes sure a name is a single, harmless path segment.
fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let sanitized = sanitized.trim();
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return "_".to_string();
    }
    truncate_file_name(sanitized)
}

/// Shortens the stem of a name that is too long, keeping its extension.
fn truncate_file_name(name: &str) -> String {
    if name.len() <= MAX_FILE_NAME_BYTES {
        return name.to_string();
    }
    let (stem, extension) = match name.rfind('.') {
        Some(idx) if idx > 0 && name.len() - idx <= MAX_EXTENSION_BYTES => name.split_at(idx),
        _ => (name, ""),
    };
    let mut end = MAX_FILE_NAME_BYTES - extension.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &stem[..end], extension)
}

/// Probes a resource for its name, then downloads it into `destination_dir`
/// unless a file with that name is already there.
#[tracing::instrument(skip(session))]
pub async fn fetch_resource(
    session: &Session,
    rule: &CrawlRule,
    link: &Url,
    destination_dir: &Path,
) -> Result<FetchOutcome, FetchError> {
    let response = session
        .client()
        .head(link.as_str())
        .send()
        .await?
        .error_for_status()?;
    // Portals put raw utf-8 in the header, which `to_str` refuses.
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default();
    let resolved_filename = resolve_filename(&disposition, link.as_str());
    tracing::debug!("File name for {} is {}", link, &resolved_filename);

    let resource = ResourceDescriptor {
        source_url: link.clone(),
        local_path: destination_dir.join(&resolved_filename),
        resolved_filename,
    };

    if !should_fetch(&resource.local_path, rule.force_update) {
        tracing::debug!(
            "File : |{}| from |{}| has already been downloaded.",
            resource.local_path.to_string_lossy(),
            resource.source_url
        );
        return Ok(FetchOutcome::Skipped(resource.local_path));
    }

    download_file(session, &resource).await?;
    tracing::info!("{}", resource.local_path.to_string_lossy());
    Ok(FetchOutcome::Downloaded(resource.local_path))
}

async fn download_file(session: &Session, resource: &ResourceDescriptor) -> Result<(), FetchError> {
    let mut response = session
        .client()
        .get(resource.source_url.as_str())
        .send()
        .await?
        .error_for_status()?;

    let mut dest_file = match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&resource.local_path)
        .await
    {
        Err(e) => {
            tracing::error!(
                "Error opening/creating file {}",
                resource.local_path.to_string_lossy()
            );
            return Err(file_error(&resource.local_path, &e));
        }
        Ok(f) => f,
    };

    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Error downloading resource from {}", resource.source_url);
                remove_partial_file(&resource.local_path).await;
                return Err(e.into());
            }
        };
        if let Err(e) = dest_file.write_all(&chunk).await {
            tracing::error!(
                "Error writing to destination file {}",
                resource.local_path.to_string_lossy()
            );
            remove_partial_file(&resource.local_path).await;
            return Err(file_error(&resource.local_path, &e));
        }
    }

    if let Err(e) = dest_file.flush().await {
        remove_partial_file(&resource.local_path).await;
        return Err(file_error(&resource.local_path, &e));
    }
    Ok(())
}

/// A file cut short by a failed download would pass for a complete one on the
/// next run.
async fn remove_partial_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(
            "Could not remove partial file {}\nError : {}",
            path.to_string_lossy(),
            e
        );
    }
}

fn file_error(path: &Path, e: &std::io::Error) -> FetchError {
    FetchError::FileOperationError {
        file_name: path.to_string_lossy().to_string(),
        message: format!("{} | {}", e, e.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESOURCE_URL: &str = "https://portal.example.org/mod/resource/view.php?id=42";

    #[test]
    fn id_is_used_without_disposition() {
        assert_eq!(resolve_filename("", RESOURCE_URL), "42");
    }

    #[test]
    fn sentinel_is_used_without_id_or_disposition() {
        assert_eq!(
            resolve_filename("", "https://portal.example.org/mod/resource/view.php"),
            FALLBACK_FILE_NAME
        );
        assert_eq!(resolve_filename("", "not a url"), FALLBACK_FILE_NAME);
    }

    #[test]
    fn disposition_name_is_prefixed_with_id() {
        let name = resolve_filename(r#"attachment; filename="notes.pdf""#, RESOURCE_URL);
        assert_eq!(name, "42_notes.pdf");
        assert!(name.ends_with("notes.pdf"));
    }

    #[test]
    fn disposition_name_alone_without_id() {
        assert_eq!(
            resolve_filename(
                "inline; filename=slides.pdf",
                "https://portal.example.org/pluginfile.php/12/mod_label/intro/slides.pdf"
            ),
            "slides.pdf"
        );
    }

    #[test]
    fn disposition_without_file_name_falls_back_to_id() {
        assert_eq!(resolve_filename("attachment", RESOURCE_URL), "42");
        assert_eq!(
            resolve_filename("attachment; filename=\"\"", "https://x/resource/view.php"),
            FALLBACK_FILE_NAME
        );
    }

    #[test]
    fn quoted_values_may_contain_separators() {
        assert_eq!(
            resolve_filename(
                r#"attachment; filename="week 1; intro.pdf"; size=100"#,
                RESOURCE_URL
            ),
            "42_week 1; intro.pdf"
        );
    }

    #[test]
    fn extended_file_name_is_preferred_and_decoded() {
        assert_eq!(
            resolve_filename(
                "attachment; filename=\"fallback.pdf\"; filename*=UTF-8''predavanje%20%C4%8D.pdf",
                RESOURCE_URL
            ),
            "42_predavanje č.pdf"
        );
    }

    #[test]
    fn server_names_cannot_escape_the_destination() {
        assert_eq!(
            resolve_filename(r#"attachment; filename="../../etc/passwd""#, "https://x/a"),
            ".._.._etc_passwd"
        );
        assert_eq!(resolve_filename(r#"attachment; filename="..""#, "https://x/a"), "_");
    }

    #[test]
    fn long_names_are_shortened_keeping_the_extension() {
        let disposition = format!(r#"attachment; filename="{}.pdf""#, "a".repeat(300));
        let name = resolve_filename(&disposition, RESOURCE_URL);
        assert_eq!(name.len(), MAX_FILE_NAME_BYTES);
        assert!(name.starts_with("42_aaa"));
        assert!(name.ends_with(".pdf"));

        let disposition = format!(r#"attachment; filename="{}.pdf""#, "č".repeat(200));
        let name = resolve_filename(&disposition, RESOURCE_URL);
        assert!(name.len() <= MAX_FILE_NAME_BYTES);
        assert!(name.starts_with("42_č"));
        assert!(name.ends_with("č.pdf"));

        let short = resolve_filename(r#"attachment; filename="notes.pdf""#, RESOURCE_URL);
        assert_eq!(short, "42_notes.pdf");
    }

    #[test]
    fn gate_skips_only_present_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.pdf");
        std::fs::write(&present, b"").unwrap();
        let missing = dir.path().join("missing.pdf");

        assert!(!should_fetch(&present, false));
        assert!(should_fetch(&present, true));
        assert!(should_fetch(&missing, false));
        assert!(should_fetch(&missing, true));
    }
}
