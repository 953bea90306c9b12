use crate::download::{fetch_resource, FetchOutcome};
use crate::link::{get_page_links, LinkKind};
use std::future::Future;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::{event, instrument, Level};
use url::Url;

pub mod download;
pub mod errors;
pub mod link;
pub mod session;

pub use errors::FetchError;
pub use session::Session;

/// Folder levels followed from a course page when nothing else is asked for.
pub const DEFAULT_MAX_FOLDER_DEPTH: u8 = 1;

#[derive(Debug, Clone)]
pub struct CrawlRule {
    /// Download resources again even when they're already on disk.
    pub force_update: bool,
    /// Max levels of folders to enter. Default is 1, which means folders listed
    /// on a course page are crawled but folders inside those are not.
    pub max_folder_depth: u8,
}

impl Default for CrawlRule {
    fn default() -> Self {
        Self {
            force_update: false,
            max_folder_depth: DEFAULT_MAX_FOLDER_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseTarget {
    pub name: String,
    pub course_id: u64,
    /// Directory the course's resources are saved to. Must already exist.
    pub local_path: PathBuf,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pages_failed: usize,
}

impl AddAssign for CrawlReport {
    fn add_assign(&mut self, other: Self) {
        self.downloaded += other.downloaded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.pages_failed += other.pages_failed;
    }
}

/// Crawls every course, one after the other.
pub async fn crawl_courses(
    session: &Session,
    rule: &CrawlRule,
    courses: &[CourseTarget],
) -> CrawlReport {
    let mut report = CrawlReport::default();
    for course in courses {
        report += crawl_course(session, rule, course).await;
    }
    report
}

#[instrument(skip(session))]
pub async fn crawl_course(session: &Session, rule: &CrawlRule, course: &CourseTarget) -> CrawlReport {
    event!(Level::INFO, "Course {} {}", course.name, course.course_id);
    let course_url = match session.course_url(course.course_id) {
        Ok(u) => u,
        Err(e) => {
            event!(Level::ERROR, "{}", e);
            return CrawlReport {
                pages_failed: 1,
                ..Default::default()
            };
        }
    };
    crawl_page(
        session,
        rule,
        rule.max_folder_depth,
        &course_url,
        &course.local_path,
    )
    .await
}

/// Downloads every resource linked from a page into `local_dir`, following
/// folder links while `folder_depth` allows. Links are handled in the order
/// they appear and a folder is fully crawled before moving on. Failures are
/// logged and counted, never propagated.
pub fn crawl_page<'a>(
    session: &'a Session,
    rule: &'a CrawlRule,
    folder_depth: u8,
    page_url: &'a Url,
    local_dir: &'a Path,
) -> Pin<Box<dyn Future<Output = CrawlReport> + 'a>> {
    Box::pin(async move {
        let mut report = CrawlReport::default();
        event!(Level::DEBUG, "Crawling {} (folder depth {})", page_url, folder_depth);

        let html = match session.get_page(page_url).await {
            Ok(html) => html,
            Err(e) => {
                event!(Level::ERROR, "Failed to fetch page {}", page_url);
                event!(Level::ERROR, "{}", e);
                report.pages_failed += 1;
                return report;
            }
        };
        let links = get_page_links(&html, page_url, folder_depth);
        event!(Level::DEBUG, "Total links found on {} {}", page_url, links.len());

        for link in links {
            match link.kind {
                LinkKind::Folder => {
                    report += crawl_page(
                        session,
                        rule,
                        folder_depth.saturating_sub(1),
                        &link.href,
                        local_dir,
                    )
                    .await;
                }
                LinkKind::Resource => {
                    match fetch_resource(session, rule, &link.href, local_dir).await {
                        Ok(FetchOutcome::Downloaded(_)) => report.downloaded += 1,
                        Ok(FetchOutcome::Skipped(_)) => report.skipped += 1,
                        Err(e) => {
                            event!(Level::ERROR, "Failed to fetch resource {}", link.href);
                            event!(Level::ERROR, "{}", e);
                            report.failed += 1;
                        }
                    }
                }
            }
        }
        report
    })
}
