use std::collections::HashSet;

use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    fetch::{Fetcher, Page},
    site::{AlbumRef, ListingSeed, NextPage, SiteAdapter},
    waiter::Band,
};

/// Markup fragments that mark an anchor as a "next page" control.
pub static NEXT_GLYPHS: &[&str] = &["→", "›", "»", "下一页", "Next", "next", "more"];

/// One listing page together with the albums found on it.
#[derive(Debug)]
pub struct ListingPage {
    pub page: Page,
    pub albums: Vec<AlbumRef>,
}

/// Lazily walks a listing from its seed until no next page is found.
///
/// A url is never requested twice in one walk.
pub struct ListingPaginator<'a> {
    fetcher: &'a Fetcher,
    adapter: &'a dyn SiteAdapter,
    seed: ListingSeed,
    next: Option<Url>,
    seen: HashSet<Url>,
    delay: Band,
    visited: usize,
}

impl<'a> ListingPaginator<'a> {
    pub fn new(
        fetcher: &'a Fetcher,
        adapter: &'a dyn SiteAdapter,
        seed: ListingSeed,
        delay: Band,
    ) -> Self {
        Self {
            fetcher,
            adapter,
            next: Some(seed.url.clone()),
            seed,
            seen: HashSet::new(),
            delay,
            visited: 0,
        }
    }

    /// Number of listing pages fetched so far.
    pub fn visited(&self) -> usize {
        self.visited
    }
}

impl Iterator for ListingPaginator<'_> {
    type Item = crate::Result<ListingPage>;

    fn next(&mut self) -> Option<Self::Item> {
        let url = self.next.take()?;

        if self.visited > 0 {
            if let Err(e) = self.fetcher.waiter().pause(self.delay) {
                return Some(Err(e));
            }
        }

        info!("listing page {}", url);
        self.seen.insert(normalize(&url));
        self.visited += 1;

        let page = match self.fetcher.page(&url) {
            Ok(Some(page)) => page,
            Ok(None) => {
                warn!("listing page {} left the site, stopping", url);
                return None;
            }
            Err(e) => return Some(Err(e)),
        };
        self.seen.insert(normalize(&page.url));

        let albums = self.adapter.discover_listing_links(&page, &self.seed);
        info!("{} albums on {}", albums.len(), page.url);

        self.next = match self.adapter.discover_next_page(&page) {
            NextPage::None => {
                debug!("no next page after {}", page.url);
                None
            }
            next => next.into_url().filter(|next| {
                if !self.fetcher.is_on_site(next) {
                    debug!("next page {} is off the site", next);
                    return false;
                }
                let fresh = !self.seen.contains(&normalize(next));
                if !fresh {
                    debug!("next page {} already visited", next);
                }
                fresh
            }),
        };

        Some(Ok(ListingPage { page, albums }))
    }
}

fn normalize(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

/// Reads the `page` query parameter.
pub fn page_number(url: &Url) -> Option<u32> {
    url.query_pairs()
        .find(|(key, _)| key == "page")
        .and_then(|(_, value)| value.parse().ok())
}

/// Returns `url` with its `page` parameter set to `page`.
pub fn with_page(url: &Url, page: u32) -> Url {
    let mut replaced = false;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            if key == "page" {
                replaced = true;
                (key.into_owned(), page.to_string())
            } else {
                (key.into_owned(), value.into_owned())
            }
        })
        .collect();
    if !replaced {
        pairs.push(("page".into(), page.to_string()));
    }

    let mut next = url.clone();
    next.set_fragment(None);
    next.query_pairs_mut().clear().extend_pairs(pairs);
    next
}

/// Decides where the listing continues after `current`.
///
/// Tries, in order: an anchor carrying a "next" glyph, an anchor whose
/// `page` parameter is one past the current page, and finally a
/// synthesized url, provided some anchor shows a higher page number.
pub fn next_page_heuristic(
    html: &Html,
    current: &Url,
    glyphs: &[&str],
    is_on_site: impl Fn(&Url) -> bool,
) -> NextPage {
    let anchors = Selector::parse("a[href]").unwrap();
    let current_page = page_number(current).unwrap_or(1);

    let linked_page = |href: &str| -> Option<u32> {
        if !href.contains("page=") {
            return None;
        }
        current.join(href).ok().as_ref().and_then(page_number)
    };

    let explicit = html
        .select(&anchors)
        .find(|a| glyphs.iter().any(|glyph| a.html().contains(glyph)))
        .or_else(|| {
            html.select(&anchors).find(|a| {
                a.value()
                    .attr("href")
                    .and_then(linked_page)
                    .map(|n| n == current_page + 1)
                    .unwrap_or(false)
            })
        });

    if let Some(anchor) = explicit {
        let href = anchor.value().attr("href").unwrap_or_default();
        return match current.join(href) {
            Ok(next) if is_on_site(&next) => NextPage::Explicit(next),
            Ok(next) => {
                warn!("next page {} leaves the site", next);
                NextPage::None
            }
            Err(_) => NextPage::None,
        };
    }

    let max_page = html
        .select(&anchors)
        .filter_map(|a| a.value().attr("href").and_then(linked_page))
        .max()
        .unwrap_or(current_page);

    if current_page < max_page {
        NextPage::Synthesized(with_page(current, current_page + 1))
    } else {
        NextPage::None
    }
}
