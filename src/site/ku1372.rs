//! Tag-grouped listings whose albums download as a single zip.

use regex::Regex;
use scraper::{ElementRef, Selector};
use tracing::{debug, info};
use url::Url;

use super::{resolve, AlbumRef, ListingSeed, NextPage, SiteAdapter};
use crate::{
    error::{Error, ExtractionFailure},
    extract::ImageSet,
    fetch::{Fetcher, Page},
};

static NEXT_LABELS: &[&str] = &["下一页", "Next", "next"];
static DOWNLOAD_LABEL: &str = "点击打包下载本套图";

pub struct Ku1372;

impl Ku1372 {
    fn is_tag_index(url: &Url) -> bool {
        url.path().trim_end_matches('/').ends_with("/b/tag")
    }

    fn tags(page: &Page) -> Vec<ListingSeed> {
        let entries = Selector::parse("ul li").unwrap();
        let anchor = Selector::parse("a").unwrap();
        let count = Selector::parse("span").unwrap();

        page.html()
            .select(&entries)
            .filter_map(|entry| {
                let a = entry.select(&anchor).next()?;
                let span = entry.select(&count).next()?;
                let url = a.value().attr("href").and_then(|href| resolve(page, href))?;
                let name = format!("{} {}", text(a), text(span));
                Some(ListingSeed::grouped(url, name.trim()))
            })
            .collect()
    }
}

fn text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Page number of a `list_<id>_<n>.html` url.
fn list_page(s: &str) -> Option<u32> {
    let pattern = Regex::new(r"_(\d+)\.html").unwrap();
    pattern
        .captures(s)
        .and_then(|captures| captures.get(1))
        .and_then(|n| n.as_str().parse().ok())
}

impl SiteAdapter for Ku1372 {
    fn name(&self) -> &'static str {
        "ku1372"
    }

    fn charset(&self) -> Option<&'static str> {
        Some("gb2312")
    }

    fn listing_seeds(&self, fetcher: &Fetcher, start: &Url) -> crate::Result<Vec<ListingSeed>> {
        if !Self::is_tag_index(start) {
            return Ok(vec![ListingSeed::new(start.clone())]);
        }

        let page = fetcher.page(start)?.ok_or_else(|| {
            Error::Extraction(ExtractionFailure::Metadata, start.to_string())
        })?;
        let tags = Self::tags(&page);
        info!("{} tags on {}", tags.len(), start);
        Ok(tags)
    }

    fn discover_listing_links(&self, page: &Page, seed: &ListingSeed) -> Vec<AlbumRef> {
        let entries = Selector::parse("div.m-list li").unwrap();
        let anchor = Selector::parse("a").unwrap();

        page.html()
            .select(&entries)
            .filter_map(|entry| {
                let a = entry.select(&anchor).next()?;
                let url = a.value().attr("href").and_then(|href| resolve(page, href))?;
                let name = a.value().attr("title").map(|title| title.trim().to_string());
                Some(AlbumRef::new(url, name, page, seed))
            })
            .collect()
    }

    fn discover_next_page(&self, page: &Page) -> NextPage {
        let pager = Selector::parse("div.page").unwrap();
        let anchors = Selector::parse("a[href]").unwrap();
        let html = page.html();

        let pager = match html.select(&pager).next() {
            Some(pager) => pager,
            None => {
                debug!("no pager on {}", page.url);
                return NextPage::None;
            }
        };

        let labelled = pager.select(&anchors).find(|a| {
            let label = text(*a);
            NEXT_LABELS.contains(&label.as_str()) || label.contains("下一页")
        });

        let current = list_page(page.url.path()).unwrap_or(1);
        let numbered = || {
            pager.select(&anchors).find(|a| {
                let href = a.value().attr("href").unwrap_or_default();
                let is_current = a
                    .value()
                    .attr("class")
                    .map(|class| class.split_whitespace().any(|c| c == "this-page"))
                    .unwrap_or(false);
                href.contains("list_") && !is_current && list_page(href) == Some(current + 1)
            })
        };

        labelled
            .or_else(numbered)
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve(page, href))
            .map(NextPage::Explicit)
            .unwrap_or(NextPage::None)
    }

    fn extract_album_images(&self, _page: &Page, _album: &AlbumRef, _found: &mut ImageSet) -> usize {
        0
    }

    fn extract_download_link(&self, page: &Page) -> Option<Url> {
        let anchors = Selector::parse("div.Title111 a[href]").unwrap();
        page.html()
            .select(&anchors)
            .find(|a| text(*a).contains(DOWNLOAD_LABEL))
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve(page, href))
    }

    fn archives_only(&self) -> bool {
        true
    }
}
