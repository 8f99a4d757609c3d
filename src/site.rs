pub mod generic;
pub mod ku1372;
pub mod meitu;

use std::{fmt, str::FromStr};

use scraper::Selector;
use tracing::debug;
use url::Url;

use crate::{
    error::{Error, UnsupportedError},
    extract::ImageSet,
    fetch::{Fetcher, Page},
};

/// Where a listing walk starts, and the directory its albums are grouped under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListingSeed {
    pub url: Url,
    pub group: Option<String>,
}

impl ListingSeed {
    pub fn new(url: Url) -> Self {
        Self { url, group: None }
    }

    pub fn grouped(url: Url, group: impl Into<String>) -> Self {
        Self {
            url,
            group: Some(group.into()),
        }
    }
}

/// An album discovered on a listing page. The url is its identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlbumRef {
    pub url: Url,
    /// Display name offered by the listing, if any.
    pub name: Option<String>,
    /// The listing page the album was found on.
    pub listing: Url,
    pub group: Option<String>,
}

impl AlbumRef {
    pub fn new(url: Url, name: Option<String>, listing: &Page, seed: &ListingSeed) -> Self {
        Self {
            url,
            name: name.filter(|name| !name.trim().is_empty()),
            listing: listing.url.clone(),
            group: seed.group.clone(),
        }
    }

    pub fn id(&self) -> &str {
        self.url.as_str()
    }
}

/// The outcome of looking for a next page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NextPage {
    None,
    /// A link present on the page.
    Explicit(Url),
    /// A url built by incrementing the page number.
    Synthesized(Url),
}

impl NextPage {
    pub fn into_url(self) -> Option<Url> {
        match self {
            NextPage::None => None,
            NextPage::Explicit(url) | NextPage::Synthesized(url) => Some(url),
        }
    }
}

/// Everything the crawler needs to know about one site's markup.
pub trait SiteAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Encoding to decode pages with when the server does not say.
    fn charset(&self) -> Option<&'static str> {
        None
    }

    /// Expands the start url into the listings to walk.
    fn listing_seeds(&self, _fetcher: &Fetcher, start: &Url) -> crate::Result<Vec<ListingSeed>> {
        Ok(vec![ListingSeed::new(start.clone())])
    }

    fn discover_listing_links(&self, page: &Page, seed: &ListingSeed) -> Vec<AlbumRef>;

    fn discover_next_page(&self, page: &Page) -> NextPage;

    fn album_title(&self, page: &Page) -> Option<String> {
        page_title(page)
    }

    /// Adds the images on one album page to `found`, returning how many were new.
    fn extract_album_images(&self, page: &Page, album: &AlbumRef, found: &mut ImageSet) -> usize;

    fn discover_next_album_page(&self, _page: &Page, _album: &AlbumRef) -> NextPage {
        NextPage::None
    }

    /// Albums offered as one archive expose a download link instead of images.
    fn extract_download_link(&self, _page: &Page) -> Option<Url> {
        None
    }

    /// Every album is an archive; a page without a download link is an error.
    fn archives_only(&self) -> bool {
        false
    }
}

/// Known adapters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Site {
    Generic,
    Meitu,
    Ku1372,
}

impl Site {
    pub fn detect(url: &Url) -> crate::Result<Site> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::Unsupported(UnsupportedError::Domain, url.to_string()))?;

        let site = if host.contains("ku1372") {
            Site::Ku1372
        } else if host.ends_with("tljkd-01.sbs") {
            Site::Meitu
        } else {
            Site::Generic
        };
        debug!("{} handled by the {} adapter", host, site);
        Ok(site)
    }

    pub fn adapter(self, domain: &str) -> Box<dyn SiteAdapter> {
        match self {
            Site::Generic => Box::new(generic::Generic::new(domain)),
            Site::Meitu => Box::new(meitu::Meitu),
            Site::Ku1372 => Box::new(ku1372::Ku1372),
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Site::Generic => "generic",
            Site::Meitu => "meitu",
            Site::Ku1372 => "ku1372",
        })
    }
}

impl FromStr for Site {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" | "sifang" => Ok(Site::Generic),
            "meitu" => Ok(Site::Meitu),
            "ku1372" => Ok(Site::Ku1372),
            other => Err(format!("unknown site adapter {:?}", other)),
        }
    }
}

/// The text of the document's `<title>`, trimmed.
pub fn page_title(page: &Page) -> Option<String> {
    let selector = Selector::parse("title").unwrap();
    let title = page
        .html()
        .select(&selector)
        .next()
        .map(|title| title.text().collect::<String>().trim().to_string())?;
    (!title.is_empty()).then_some(title)
}

/// Joins an attribute value against the page it was found on.
pub(crate) fn resolve(page: &Page, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with('#') {
        return None;
    }
    page.url.join(href).ok()
}
