//! Image discovery on album pages.
//!
//! The strict pass keeps images that look like the album's own content and
//! drops ads, hidden overlays, icons and thumbnails of other albums. When it
//! finds nothing although the page has images, a relaxed pass that only
//! screens obvious ads runs instead.

use std::collections::HashSet;

use scraper::{ElementRef, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::fetch::Page;

/// Image urls collected for one album, in first-seen order, without repeats.
#[derive(Clone, Debug, Default)]
pub struct ImageSet {
    urls: Vec<Url>,
    seen: HashSet<Url>,
}

impl ImageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `url` was already present.
    pub fn insert(&mut self, url: Url) -> bool {
        if self.seen.contains(&url) {
            return false;
        }
        self.seen.insert(url.clone());
        self.urls.push(url);
        true
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn into_vec(self) -> Vec<Url> {
        self.urls
    }
}

impl Extend<Url> for ImageSet {
    fn extend<T: IntoIterator<Item = Url>>(&mut self, iter: T) {
        for url in iter {
            self.insert(url);
        }
    }
}

/// Tunable filter lists for the extractor.
#[derive(Clone, Debug)]
pub struct ExtractPolicy {
    pub site_domain: String,
    /// Path fragment that identifies album pages.
    pub album_marker: String,
    pub ad_keywords: Vec<String>,
    /// The only screen applied by the relaxed pass.
    pub relaxed_ad_keywords: Vec<String>,
    /// Image hosts accepted anywhere on the page.
    pub trusted_hosts: Vec<String>,
    pub extensions: Vec<String>,
    /// Declared width or height below this marks an icon.
    pub min_dimension: u32,
    pub recommend_keywords: Vec<String>,
    /// Tried in order; the first match is the content region.
    pub content_selectors: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ExtractPolicy {
    pub fn for_site(domain: &str) -> Self {
        Self {
            site_domain: domain.to_string(),
            album_marker: "/albums/".into(),
            ad_keywords: strings(&[
                "ad/",
                "ads/",
                "advertisement/",
                "banner/",
                "doubleclick.net",
                "googlesyndication.com",
                "adserver.",
                "affiliate.",
                "tracking.",
            ]),
            relaxed_ad_keywords: strings(&["ad.", "ads.", "advertisement"]),
            trusted_hosts: strings(&["wp.com", "imgbox.com", "imgur.com", "pixhost.to"]),
            extensions: strings(&[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp"]),
            min_dimension: 100,
            recommend_keywords: strings(&["recommend", "related", "推荐", "相关", "more", "更多"]),
            content_selectors: strings(&["article", "div.post-content", "div.entry-content"]),
        }
    }

    fn is_on_site(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| {
                host == self.site_domain || host.ends_with(&format!(".{}", self.site_domain))
            })
            .unwrap_or(false)
    }

    fn has_image_extension(&self, url: &Url) -> bool {
        let path = url.path().to_ascii_lowercase();
        self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
    }

    fn is_trusted(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| self.trusted_hosts.iter().any(|trusted| host.contains(trusted.as_str())))
            .unwrap_or(false)
    }
}

/// Adds the album images on `page` to `found` and returns how many were new.
pub fn extract_images(page: &Page, policy: &ExtractPolicy, found: &mut ImageSet) -> usize {
    let html = page.html();
    let images = Selector::parse("img[src]").unwrap();

    let region = policy
        .content_selectors
        .iter()
        .filter_map(|selector| Selector::parse(selector).ok())
        .find_map(|selector| html.select(&selector).next());

    let candidates: Vec<ElementRef> = match region {
        Some(region) => region.select(&images).collect(),
        None => html.select(&images).collect(),
    };
    debug!(
        "{} img tags on {} ({})",
        candidates.len(),
        page.url,
        if region.is_some() { "content region" } else { "whole page" }
    );

    let blocks = Selector::parse("div[class], section[class]").unwrap();
    let recommended: HashSet<_> = html
        .select(&blocks)
        .filter(|block| {
            let class = block.value().attr("class").unwrap_or_default().to_lowercase();
            policy
                .recommend_keywords
                .iter()
                .any(|keyword| class.contains(keyword.as_str()))
        })
        .map(|block| block.id())
        .collect();
    let mut passed = 0;
    let mut added = 0;

    for img in &candidates {
        let url = match image_url(page, img) {
            Some(url) => url,
            None => continue,
        };
        let lowered = url.as_str().to_ascii_lowercase();

        if policy.ad_keywords.iter().any(|ad| lowered.contains(ad.as_str())) {
            debug!("ad url, skipping {}", url);
            continue;
        }
        if is_hidden(img) {
            debug!("hidden image, skipping {}", url);
            continue;
        }
        if is_undersized(img, policy.min_dimension) {
            debug!("undersized image, skipping {}", url);
            continue;
        }
        if links_to_other_album(page, img, policy) {
            debug!("thumbnail of another album, skipping {}", url);
            continue;
        }
        if img.ancestors().any(|node| recommended.contains(&node.id())) {
            debug!("inside a recommendation block, skipping {}", url);
            continue;
        }
        if !policy.has_image_extension(&url) {
            continue;
        }
        if !policy.is_trusted(&url) && policy.is_on_site(&url) && region.is_none() {
            debug!("site image outside the content region, skipping {}", url);
            continue;
        }

        passed += 1;
        if found.insert(url) {
            added += 1;
        }
    }

    if passed == 0 && !candidates.is_empty() {
        warn!("no images passed the filters on {}, relaxing", page.url);
        added = relaxed_pass(page, &candidates, policy, found);
    }

    added
}

fn relaxed_pass(
    page: &Page,
    candidates: &[ElementRef],
    policy: &ExtractPolicy,
    found: &mut ImageSet,
) -> usize {
    let mut added = 0;
    for img in candidates {
        let url = match image_url(page, img) {
            Some(url) => url,
            None => continue,
        };
        let lowered = url.as_str().to_ascii_lowercase();

        if policy
            .relaxed_ad_keywords
            .iter()
            .any(|ad| lowered.contains(ad.as_str()))
            || links_to_other_album(page, img, policy)
            || !policy.has_image_extension(&url)
        {
            continue;
        }

        if found.insert(url) {
            added += 1;
        }
    }
    added
}

fn image_url(page: &Page, img: &ElementRef) -> Option<Url> {
    img.value()
        .attr("src")
        .and_then(|src| crate::site::resolve(page, src))
}

fn is_hidden(img: &ElementRef) -> bool {
    let style = match img.value().attr("style") {
        Some(style) => style.to_ascii_lowercase(),
        None => return false,
    };

    style.split(';').any(|declaration| {
        let (property, value) = match declaration.split_once(':') {
            Some(pair) => pair,
            None => return false,
        };
        let value = value.trim().trim_end_matches("!important").trim();
        match property.trim() {
            "opacity" => value.parse::<f64>().map(|v| v == 0.0).unwrap_or(false),
            "visibility" => value == "hidden",
            "display" => value == "none",
            _ => false,
        }
    })
}

fn is_undersized(img: &ElementRef, min: u32) -> bool {
    let dimension = |name| {
        img.value()
            .attr(name)
            .and_then(|value: &str| value.trim().trim_end_matches("px").parse::<u32>().ok())
    };
    match (dimension("width"), dimension("height")) {
        (Some(width), Some(height)) => width < min || height < min,
        _ => false,
    }
}

fn links_to_other_album(page: &Page, img: &ElementRef, policy: &ExtractPolicy) -> bool {
    img.ancestors()
        .filter_map(|node| node.value().as_element())
        .filter(|element| element.name() == "a")
        .filter_map(|anchor| anchor.attr("href"))
        .filter(|href| href.contains(policy.album_marker.as_str()))
        .any(|href| crate::site::resolve(page, href).as_ref() != Some(&page.url))
}
