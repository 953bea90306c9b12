use html5ever::tendril::StrTendril;
use html5ever::tokenizer::{
    BufferQueue, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer, TokenizerOpts,
    TokenizerResult,
};
use phf::phf_map;
use scraper::Html;
use std::collections::HashSet;
use tracing::{event, instrument, Level};
use url::{ParseError, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// A terminal, downloadable file reference.
    Resource,
    /// A page listing further resources, followed while the folder budget lasts.
    Folder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDecision {
    Ignore,
    Follow(LinkKind),
}

/// Url fragments the portal uses for content worth fetching. A link is matched
/// when it contains one of the keys. Folder entries only apply while there is
/// recursion budget left.
static LINK_PATTERNS: phf::Map<&'static str, LinkKind> = phf_map! {
    "/resource/view.php" => LinkKind::Resource,
    "mod_label/intro/" => LinkKind::Resource,
    "mod_page/content" => LinkKind::Resource,
    "/folder/view.php" => LinkKind::Folder,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLink {
    pub href: Url,
    pub kind: LinkKind,
}

/// Decide whether a link should be followed and as what. `folder_depth` is the
/// number of folder levels that may still be entered from the current page.
pub fn classify(href: &str, folder_depth: u8) -> LinkDecision {
    let mut decision = LinkDecision::Ignore;
    for (pattern, kind) in LINK_PATTERNS.entries() {
        if !href.contains(pattern) {
            continue;
        }
        match kind {
            LinkKind::Resource => return LinkDecision::Follow(LinkKind::Resource),
            LinkKind::Folder if folder_depth > 0 => {
                decision = LinkDecision::Follow(LinkKind::Folder)
            }
            LinkKind::Folder => {}
        }
    }
    decision
}

/// Collects the `href` of anchor start tags. The tokenizer is paused after
/// each one so links are handed out as they're found.
#[derive(Default)]
struct AnchorSink {
    pending: Option<String>,
}

impl TokenSink for AnchorSink {
    type Handle = ();

    fn process_token(&mut self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
        if let Token::TagToken(Tag {
            kind: TagKind::StartTag,
            name,
            attrs,
            ..
        }) = token
        {
            if &*name == "a" {
                if let Some(href) = attrs.into_iter().find(|attr| &*attr.name.local == "href") {
                    self.pending = Some(href.value.to_string());
                    return TokenSinkResult::Script(());
                }
            }
        }
        TokenSinkResult::Continue
    }
}

/// The `href` of every anchor start tag, in the order the tags appear in the
/// source, duplicates included. Anchors without the attribute are skipped.
pub struct AnchorHrefs {
    tokenizer: Tokenizer<AnchorSink>,
    input: BufferQueue,
    finished: bool,
}

impl Iterator for AnchorHrefs {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(href) = self.tokenizer.sink.pending.take() {
                return Some(href);
            }
            if self.finished {
                return None;
            }
            if let TokenizerResult::Done = self.tokenizer.feed(&mut self.input) {
                self.tokenizer.end();
                self.finished = true;
            }
        }
    }
}

/// Tokenizes a page lazily. Broken markup never stops extraction, a tag cut
/// off by the end of input is dropped and everything before it is kept.
pub fn extract_links(html: &str) -> AnchorHrefs {
    let mut input = BufferQueue::new();
    input.push_back(StrTendril::from_slice(html));
    AnchorHrefs {
        tokenizer: Tokenizer::new(AnchorSink::default(), TokenizerOpts::default()),
        input,
        finished: false,
    }
}

/// A parsed html page, used to read form fields.
pub struct PageDocument(Html);

impl PageDocument {
    pub fn parse(html: &str) -> Self {
        Self(Html::parse_document(html))
    }

    /// Value of the first `<input>` with the given name.
    pub fn input_value(&self, name: &str) -> Option<&str> {
        self.0
            .tree
            .root()
            .descendants()
            .filter_map(|node| node.value().as_element())
            .filter(|element| element.name() == "input" && element.attr("name") == Some(name))
            .find_map(|element| element.attr("value"))
    }
}

#[instrument]
/// Get the full link to a sub-page or file, given a page's full url.
pub fn get_full_link(link: &str, page_url: &Url) -> Option<Url> {
    if link.is_empty() {
        return None;
    }
    let full_link = match Url::parse(link) {
        Ok(url) => url,
        Err(e)
            if e == ParseError::EmptyHost
                || e == ParseError::RelativeUrlWithoutBase
                || e == ParseError::RelativeUrlWithCannotBeABaseBase =>
        {
            match page_url.join(link) {
                Ok(url) => url,
                Err(e) => {
                    event!(Level::ERROR, "Failed to join {} onto {}", link, page_url);
                    event!(Level::ERROR, "{}", e);
                    return None;
                }
            }
        }
        Err(e) => {
            event!(Level::ERROR, "Failed to get full link for {}", link);
            event!(Level::ERROR, "{}", e);
            return None;
        }
    };
    Some(full_link)
}

/// Gets every followable link of a page, in document order. Links are resolved
/// against the page's url before being classified and each target is kept only
/// the first time it shows up.
pub fn get_page_links(html_string: &str, page_url: &Url, folder_depth: u8) -> Vec<PageLink> {
    let mut seen: HashSet<Url> = HashSet::new();
    let mut links = Vec::new();
    for raw_link in extract_links(html_string) {
        let mut full_link = match get_full_link(&raw_link, page_url) {
            Some(l) => l,
            None => continue,
        };
        full_link.set_fragment(None);
        let kind = match classify(full_link.as_str(), folder_depth) {
            LinkDecision::Ignore => continue,
            LinkDecision::Follow(kind) => kind,
        };
        if !seen.insert(full_link.clone()) {
            continue;
        }
        event!(Level::DEBUG, "{:?} link {} => {}", kind, raw_link, &full_link);
        links.push(PageLink {
            href: full_link,
            kind,
        });
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESOURCE_LINKS: [&str; 3] = [
        "https://portal.example.org/mod/resource/view.php?id=42",
        "https://portal.example.org/pluginfile.php/12/mod_label/intro/slides.pdf",
        "https://portal.example.org/pluginfile.php/7/mod_page/content/3/notes.txt",
    ];

    const FOLDER_LINK: &str = "https://portal.example.org/mod/folder/view.php?id=9";

    #[test]
    fn resource_links_are_followed_at_any_depth() {
        for link in RESOURCE_LINKS {
            for depth in [0, 1, 5] {
                assert_eq!(
                    classify(link, depth),
                    LinkDecision::Follow(LinkKind::Resource),
                    "{link} at depth {depth}"
                );
            }
        }
    }

    #[test]
    fn folder_links_need_recursion_budget() {
        assert_eq!(
            classify(FOLDER_LINK, 1),
            LinkDecision::Follow(LinkKind::Folder)
        );
        assert_eq!(
            classify(FOLDER_LINK, 3),
            LinkDecision::Follow(LinkKind::Folder)
        );
        assert_eq!(classify(FOLDER_LINK, 0), LinkDecision::Ignore);
    }

    #[test]
    fn unrelated_links_are_ignored() {
        for link in [
            "https://portal.example.org/course/view.php?id=3",
            "https://portal.example.org/user/profile.php",
            "#section-2",
            "",
        ] {
            assert_eq!(classify(link, 1), LinkDecision::Ignore);
        }
    }

    #[test]
    fn anchors_are_returned_in_document_order() {
        let html = r#"<html><body>
            <a href="/one">1</a>
            <p><a name="no-href">skip</a></p>
            <div><a href="/two">2</a><a href="/one">1 again</a></div>
            <link href="/style.css" rel="stylesheet">
            <a href="">empty</a>
        </body></html>"#;
        let hrefs: Vec<String> = extract_links(html).collect();
        assert_eq!(hrefs, vec!["/one", "/two", "/one", ""]);
    }

    #[test]
    fn truncated_html_keeps_anchors_parsed_so_far() {
        let html = r#"<html><body><a href="/first">a</a><div><a href="/second">b</a><a hre"#;
        let hrefs: Vec<String> = extract_links(html).collect();
        assert_eq!(hrefs, vec!["/first", "/second"]);
    }

    #[test]
    fn malformed_html_does_not_stop_extraction() {
        let html = r#"<div><a href="/a">one</div></span><p><a href=/b>two<a href='/c'>three"#;
        let hrefs: Vec<String> = extract_links(html).collect();
        assert_eq!(hrefs, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn anchors_reopened_by_formatting_recovery_are_not_duplicated() {
        let hrefs: Vec<String> = extract_links(r#"<p><a href="/x">one<p>two</a>"#).collect();
        assert_eq!(hrefs, vec!["/x"]);
    }

    #[test]
    fn stray_table_content_keeps_source_order() {
        let html = r#"<table><tr><td><a href="/1">1</a></td></tr><a href="/2">2</a></table>"#;
        let hrefs: Vec<String> = extract_links(html).collect();
        assert_eq!(hrefs, vec!["/1", "/2"]);
    }

    #[test]
    fn character_references_in_hrefs_are_decoded() {
        let html = r#"<A HREF="/mod/resource/view.php?redirect=1&amp;id=4">x</A>"#;
        let hrefs: Vec<String> = extract_links(html).collect();
        assert_eq!(hrefs, vec!["/mod/resource/view.php?redirect=1&id=4"]);
    }

    #[test]
    fn extraction_is_lazy() {
        let mut hrefs = extract_links(r#"<a href="/1"></a><a href="/2"></a>"#);
        assert_eq!(hrefs.next().as_deref(), Some("/1"));
        assert_eq!(hrefs.next().as_deref(), Some("/2"));
        assert_eq!(hrefs.next(), None);
        assert_eq!(hrefs.next(), None);
    }

    #[test]
    fn input_values_are_found_by_name() {
        let html = r#"<form><input type="hidden" name="logintoken" value="s3cr3t">
            <input name="username"></form>"#;
        let document = PageDocument::parse(html);
        assert_eq!(document.input_value("logintoken"), Some("s3cr3t"));
        assert_eq!(document.input_value("username"), None);
        assert_eq!(document.input_value("password"), None);
    }

    #[test]
    fn relative_links_are_resolved_against_the_page() {
        let page = Url::parse("https://portal.example.org/course/view.php?id=3").unwrap();
        assert_eq!(
            get_full_link("/mod/resource/view.php?id=4", &page).unwrap().as_str(),
            "https://portal.example.org/mod/resource/view.php?id=4"
        );
        assert!(get_full_link("", &page).is_none());
    }

    #[test]
    fn page_links_are_classified_and_deduplicated() {
        let page = Url::parse("https://portal.example.org/course/view.php?id=3").unwrap();
        let html = r#"
            <a href="/mod/resource/view.php?id=4"><img src="icon.png"></a>
            <a href="/mod/resource/view.php?id=4">Lecture 1</a>
            <a href="/mod/folder/view.php?id=5">Exercises</a>
            <a href="/mod/forum/view.php?id=6">Forum</a>
            <a href="/mod/resource/view.php?id=7#top">Lecture 2</a>
        "#;

        let links = get_page_links(html, &page, 1);
        let got: Vec<(&str, LinkKind)> = links.iter().map(|l| (l.href.as_str(), l.kind)).collect();
        assert_eq!(
            got,
            vec![
                (
                    "https://portal.example.org/mod/resource/view.php?id=4",
                    LinkKind::Resource
                ),
                (
                    "https://portal.example.org/mod/folder/view.php?id=5",
                    LinkKind::Folder
                ),
                (
                    "https://portal.example.org/mod/resource/view.php?id=7",
                    LinkKind::Resource
                ),
            ]
        );

        let without_folders = get_page_links(html, &page, 0);
        assert!(without_folders.iter().all(|l| l.kind == LinkKind::Resource));
        assert_eq!(without_folders.len(), 2);
    }
}
