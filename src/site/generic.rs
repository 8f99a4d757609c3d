//! Heuristic adapter for sites without a dedicated one.
//!
//! Albums are anchors whose href carries `/albums/`; pagination follows
//! "next" glyphs and `page` query parameters.

use scraper::Selector;
use url::Url;

use super::{resolve, AlbumRef, ListingSeed, NextPage, SiteAdapter};
use crate::{
    extract::{self, ExtractPolicy, ImageSet},
    fetch::Page,
    paginate::{self, NEXT_GLYPHS},
};

pub struct Generic {
    policy: ExtractPolicy,
}

impl Generic {
    pub fn new(domain: &str) -> Self {
        Self {
            policy: ExtractPolicy::for_site(domain),
        }
    }

    pub fn with_policy(policy: ExtractPolicy) -> Self {
        Self { policy }
    }

    fn is_on_site(&self, url: &Url) -> bool {
        let domain = &self.policy.site_domain;
        url.host_str()
            .map(|host| host == domain || host.ends_with(&format!(".{}", domain)))
            .unwrap_or(false)
    }

    fn is_same_album(&self, url: &Url, album: &AlbumRef) -> bool {
        let base = album.url.path().trim_end_matches('/');
        let path = url.path().trim_end_matches('/');
        self.is_on_site(url) && (path == base || path.starts_with(&format!("{}/", base)))
    }
}

impl SiteAdapter for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn discover_listing_links(&self, page: &Page, seed: &ListingSeed) -> Vec<AlbumRef> {
        let anchors = Selector::parse("a[href]").unwrap();
        let mut albums: Vec<AlbumRef> = Vec::new();

        for anchor in page.html().select(&anchors) {
            let href = anchor.value().attr("href").unwrap_or_default();
            if !href.contains(self.policy.album_marker.as_str()) {
                continue;
            }
            if let Some(url) = resolve(page, href) {
                if !albums.iter().any(|album| album.url == url) {
                    albums.push(AlbumRef::new(url, None, page, seed));
                }
            }
        }

        albums
    }

    fn discover_next_page(&self, page: &Page) -> NextPage {
        paginate::next_page_heuristic(&page.html(), &page.url, NEXT_GLYPHS, |url| {
            self.is_on_site(url)
        })
    }

    fn album_title(&self, page: &Page) -> Option<String> {
        let title = super::page_title(page)?;
        Some(match title.split_once(" | ") {
            Some((head, _)) => head.to_string(),
            None => title,
        })
    }

    fn extract_album_images(&self, page: &Page, _album: &AlbumRef, found: &mut ImageSet) -> usize {
        extract::extract_images(page, &self.policy, found)
    }

    /// Only links that stay inside the album count.
    fn discover_next_album_page(&self, page: &Page, album: &AlbumRef) -> NextPage {
        let anchors = Selector::parse("a[href]").unwrap();
        let html = page.html();
        let current = paginate::page_number(&page.url).unwrap_or(1);

        let in_album = |href: &str| {
            resolve(page, href).filter(|url| self.is_same_album(url, album) && *url != page.url)
        };

        let by_glyph = html.select(&anchors).find_map(|a| {
            let markup = a.html();
            if NEXT_GLYPHS.iter().any(|glyph| markup.contains(glyph)) {
                a.value().attr("href").and_then(&in_album)
            } else {
                None
            }
        });

        let by_number = || {
            html.select(&anchors).find_map(|a| {
                let url = a.value().attr("href").and_then(&in_album)?;
                (paginate::page_number(&url) == Some(current + 1)).then_some(url)
            })
        };

        match by_glyph.or_else(by_number) {
            Some(url) => NextPage::Explicit(url),
            None => NextPage::None,
        }
    }
}
