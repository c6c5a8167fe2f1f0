//! Listing page parser
//!
//! Turns one fetched newest-listings page into canonical items. Parsing is
//! tolerant: a card missing a required field is dropped on its own, and only
//! a page without the listing container at all is a page-level failure.

use crate::catalog::{ParsedItem, SourceFields};
use crate::crawler::RawPage;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

const CONTAINER_SELECTOR: &str = ".l-market-grid, .market-grid, .item-list";
const CARD_SELECTOR: &str = "li.item-card, .market-item-card";
const TITLE_LINK_SELECTOR: &str = ".item-card__title a, .market-item-card__title a";
const SHOP_SELECTOR: &str = ".item-card__shop-name, .market-item-card__shop-name";
const PRICE_SELECTOR: &str = ".price, .item-card__price";
const THUMBNAIL_SELECTOR: &str = ".item-card__thumbnail-image, .market-item-card__thumbnail img";
const NEXT_PAGE_SELECTOR: &str = ".pager .next a, a[rel=\"next\"]";

/// Page-level parse failures
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Listing container not found on {url}")]
    MissingContainer { url: String },

    #[error("Malformed product page {url}: {reason}")]
    MalformedDetail { url: String, reason: String },
}

/// An item that was present on the page but could not be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedItem {
    /// Position of the card on the page (0-based)
    pub position: usize,
    pub reason: String,
}

/// Everything extracted from one listing page
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    /// Usable items in page order, deduplicated by external id
    pub items: Vec<ParsedItem>,
    /// Cards dropped for missing required fields
    pub dropped: Vec<DroppedItem>,
    /// Whether the pager links to a further page
    pub has_next_page: bool,
}

/// Parses a newest-listings page
///
/// # Required fields
///
/// Each card must yield an external item id (from `data-product-id` or the
/// `/items/<id>` link) and a non-empty title. Price, shop, tags and images
/// are optional and default to empty.
///
/// # Example
///
/// ```
/// use market_ingest::crawler::{parse_listing, RawPage};
/// use url::Url;
///
/// let html = r#"<ul class="l-market-grid">
///   <li class="item-card" data-product-id="42">
///     <div class="item-card__title"><a href="/items/42">Hat</a></div>
///   </li>
/// </ul>"#;
/// let page = RawPage {
///     url: Url::parse("https://market.example.com/items").unwrap(),
///     status: 200,
///     body: html.to_string(),
/// };
/// let listing = parse_listing(&page).unwrap();
/// assert_eq!(listing.items[0].external_id, "42");
/// ```
pub fn parse_listing(page: &RawPage) -> Result<ListingPage, ParseError> {
    let document = Html::parse_document(&page.body);

    let container = selector(CONTAINER_SELECTOR);
    if document.select(&container).next().is_none() {
        return Err(ParseError::MissingContainer {
            url: page.url.to_string(),
        });
    }

    let mut listing = ListingPage {
        has_next_page: document.select(&selector(NEXT_PAGE_SELECTOR)).next().is_some(),
        ..ListingPage::default()
    };

    let mut seen = HashSet::new();
    for (position, card) in document.select(&selector(CARD_SELECTOR)).enumerate() {
        match parse_card(card, &page.url) {
            Ok(item) => {
                if seen.insert(item.external_id.clone()) {
                    listing.items.push(item);
                }
            }
            Err(reason) => listing.dropped.push(DroppedItem { position, reason }),
        }
    }

    Ok(listing)
}

fn parse_card(card: ElementRef<'_>, base_url: &Url) -> Result<ParsedItem, String> {
    let link = card.select(&selector(TITLE_LINK_SELECTOR)).next();
    let href = link.and_then(|a| a.value().attr("href"));
    let item_url = href.and_then(|h| base_url.join(h).ok());

    let external_id = card
        .value()
        .attr("data-product-id")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(|| item_url.as_ref().and_then(item_id_from_url))
        .ok_or_else(|| "missing external item id".to_string())?;

    let title = card
        .value()
        .attr("data-product-name")
        .map(str::to_string)
        .or_else(|| link.map(element_text))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| format!("item {} has no title", external_id))?;

    let url = match item_url {
        Some(url) => url.to_string(),
        None => base_url
            .join(&format!("/items/{}", external_id))
            .map(|u| u.to_string())
            .map_err(|e| format!("item {} has no usable URL: {}", external_id, e))?,
    };

    let price_text = card
        .value()
        .attr("data-product-price")
        .map(str::to_string)
        .or_else(|| card.select(&selector(PRICE_SELECTOR)).next().map(element_text));
    let (price_low, price_high) = price_text
        .as_deref()
        .map(parse_price_range)
        .unwrap_or((None, None));

    let shop_name = card
        .value()
        .attr("data-product-brand")
        .map(str::to_string)
        .or_else(|| card.select(&selector(SHOP_SELECTOR)).next().map(element_text))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let shop_url = card
        .select(&selector(SHOP_SELECTOR))
        .next()
        .and_then(|shop| {
            shop.value()
                .attr("href")
                .or_else(|| shop.select(&selector("a")).next()?.value().attr("href"))
        })
        .and_then(|href| base_url.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_default();

    let image_urls = card
        .select(&selector(THUMBNAIL_SELECTOR))
        .filter_map(|img| {
            let v = img.value();
            v.attr("data-original").or_else(|| v.attr("src"))
        })
        .filter_map(|src| base_url.join(src).ok())
        .map(|u| u.to_string())
        .collect();

    Ok(ParsedItem::new(
        external_id,
        SourceFields {
            url,
            title,
            price_low,
            price_high,
            image_urls,
            shop_name,
            shop_url,
            ..SourceFields::default()
        },
    ))
}

/// Extracts the numeric id from an `/items/<id>` URL
pub fn item_id_from_url(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "items" {
            let id = segments.next()?;
            if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
                return Some(id.to_string());
            }
            return None;
        }
    }
    None
}

/// Reads every number in a price label and returns (lowest, highest)
///
/// Handles forms like `¥ 500`, `1,200 JPY` and `500 ~ 1,500`.
pub fn parse_price_range(text: &str) -> (Option<i64>, Option<i64>) {
    let numbers: Vec<i64> = text
        .split(|c: char| !(c.is_ascii_digit() || c == ','))
        .map(|chunk| chunk.replace(',', ""))
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| chunk.parse().ok())
        .collect();

    (numbers.iter().min().copied(), numbers.iter().max().copied())
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Parses a selector that is a compile-time constant
pub(crate) fn selector(css: &'static str) -> Selector {
    match Selector::parse(css) {
        Ok(selector) => selector,
        Err(e) => unreachable!("invalid built-in selector {:?}: {:?}", css, e),
    }
}
