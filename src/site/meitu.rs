use scraper::Selector;
use tracing::{debug, warn};

use super::{resolve, AlbumRef, ListingSeed, NextPage, SiteAdapter};
use crate::{extract::ImageSet, fetch::Page};

/// Album pages list every image in one `data-screenshots` attribute.
pub struct Meitu;

impl SiteAdapter for Meitu {
    fn name(&self) -> &'static str {
        "meitu"
    }

    fn discover_listing_links(&self, page: &Page, seed: &ListingSeed) -> Vec<AlbumRef> {
        let items = Selector::parse(".videos-list-wrap .video-item-col").unwrap();
        let titles = Selector::parse(".video-desc-content").unwrap();

        page.html()
            .select(&items)
            .filter_map(|item| {
                let url = item
                    .value()
                    .attr("href")
                    .and_then(|href| resolve(page, href))?;
                let title = item
                    .select(&titles)
                    .next()
                    .map(|title| title.text().collect::<String>().trim().to_string())
                    .filter(|title| !title.is_empty());

                if title.is_none() {
                    debug!("listing entry {} has no title, skipping", url);
                    return None;
                }
                Some(AlbumRef::new(url, title, page, seed))
            })
            .collect()
    }

    fn discover_next_page(&self, page: &Page) -> NextPage {
        let next = Selector::parse(".mo-paging .paging-item--next").unwrap();
        page.html()
            .select(&next)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve(page, href))
            .map(NextPage::Explicit)
            .unwrap_or(NextPage::None)
    }

    fn extract_album_images(&self, page: &Page, _album: &AlbumRef, found: &mut ImageSet) -> usize {
        let container = Selector::parse("#book-pages").unwrap();
        let html = page.html();

        let screenshots = match html
            .select(&container)
            .next()
            .and_then(|pages| pages.value().attr("data-screenshots"))
        {
            Some(screenshots) => screenshots,
            None => {
                warn!("no image list on {}", page.url);
                return 0;
            }
        };

        let before = found.len();
        found.extend(
            screenshots
                .split("#$")
                .map(|entry| {
                    let entry = entry.trim();
                    entry.strip_prefix('$').unwrap_or(entry)
                })
                .filter_map(|entry| resolve(page, entry)),
        );
        found.len() - before
    }
}
