//! Product detail page enrichment
//!
//! When enabled, each listed item's detail page is fetched and merged over
//! the listing data. The schema.org `Product` block is preferred; the DOM is
//! consulted for anything it lacks.

use crate::catalog::{ParsedItem, SourceFields};
use crate::crawler::parser::{element_text, parse_price_range, selector};
use crate::crawler::{ParseError, RawPage};
use scraper::Html;
use serde_json::Value;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

const JSON_LD_SELECTOR: &str = "script[type=\"application/ld+json\"]";
const TITLE_SELECTOR: &str = "h1.market-item-detail-item-title";
const DESCRIPTION_SELECTOR: &str = ".market-item-detail-item-description";
const PRICE_SELECTOR: &str = ".market-item-detail-price";
const SHOP_SELECTOR: &str = ".market-item-detail-shop-name a";
const TAG_SELECTOR: &str = "a[href*=\"/tags/\"]";
const IMAGE_SELECTOR: &str = ".market-item-detail-item-image img";
const R18_BADGE_SELECTOR: &str = ".badge--r18";

const AGE_LABEL: &str = "対象年齢";

/// Merges a detail page over the listing entry for the same item
///
/// Listing values survive where the detail page is silent. A detail page
/// without any recognisable title is malformed.
pub fn parse_detail(page: &RawPage, listed: &ParsedItem) -> Result<ParsedItem, ParseError> {
    let document = Html::parse_document(&page.body);
    let product = find_product_schema(&document);
    let base = &listed.source;

    let title = product
        .as_ref()
        .and_then(|p| string_field(p, "name"))
        .or_else(|| first_text(&document, TITLE_SELECTOR))
        .ok_or_else(|| ParseError::MalformedDetail {
            url: page.url.to_string(),
            reason: "no product title".to_string(),
        })?;

    let description = product
        .as_ref()
        .and_then(|p| string_field(p, "description"))
        .or_else(|| first_text(&document, DESCRIPTION_SELECTOR))
        .unwrap_or_else(|| base.description.clone());

    let (price_low, price_high) = product
        .as_ref()
        .and_then(schema_price_range)
        .or_else(|| {
            first_text(&document, PRICE_SELECTOR)
                .map(|t| parse_price_range(&t))
                .filter(|range| range.0.is_some())
        })
        .unwrap_or((base.price_low, base.price_high));

    // The shop link is more reliable than the schema's seller block
    let seller = product
        .as_ref()
        .and_then(|p| p.get("offers"))
        .and_then(first_offer)
        .and_then(|o| o.get("seller"));
    let shop_name = first_text(&document, SHOP_SELECTOR)
        .or_else(|| seller.and_then(|s| string_field(s, "name")))
        .unwrap_or_else(|| base.shop_name.clone());
    let shop_url = document
        .select(&selector(SHOP_SELECTOR))
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string)
        .or_else(|| seller.and_then(|s| string_field(s, "url")))
        .and_then(|href| page.url.join(&href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| base.shop_url.clone());

    let mut image_urls = product.as_ref().map(schema_images).unwrap_or_default();
    if image_urls.is_empty() {
        image_urls = document
            .select(&selector(IMAGE_SELECTOR))
            .filter_map(|img| {
                let v = img.value();
                v.attr("data-origin").or_else(|| v.attr("src"))
            })
            .filter_map(|src| page.url.join(src).ok())
            .map(|u| u.to_string())
            .collect();
    }
    if image_urls.is_empty() {
        image_urls = base.image_urls.clone();
    }

    let official_tags = dedup_tags(document.select(&selector(TAG_SELECTOR)).map(element_text));

    let age_rating = extract_age_rating(&description)
        .or_else(|| {
            let body_text: String = document.root_element().text().collect();
            extract_age_rating(&body_text)
        })
        .or_else(|| {
            document
                .select(&selector(R18_BADGE_SELECTOR))
                .next()
                .map(|_| "R-18".to_string())
        });

    Ok(ParsedItem::new(
        listed.external_id.clone(),
        SourceFields {
            url: base.url.clone(),
            title,
            description,
            price_low,
            price_high,
            image_urls,
            official_tags,
            shop_name,
            shop_url,
            age_rating,
        },
    ))
}

/// Folds a tag name to its comparison key: NFKC, lower case, single spaces
fn normalize_tag_name(name: &str) -> String {
    let folded: String = name.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drops tags whose normalized form was already seen
///
/// The first spelling of each tag is kept as its display form.
fn dedup_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .filter(|tag| {
            let key = normalize_tag_name(tag);
            !key.is_empty() && seen.insert(key)
        })
        .collect()
}

/// Finds the first JSON-LD block describing a `Product`
fn find_product_schema(document: &Html) -> Option<Value> {
    for script in document.select(&selector(JSON_LD_SELECTOR)) {
        let raw: String = script.text().collect();
        let json: Value = match serde_json::from_str(raw.trim()) {
            Ok(json) => json,
            Err(e) => {
                tracing::debug!("Ignoring unparseable JSON-LD block: {}", e);
                continue;
            }
        };

        let candidates = match json {
            Value::Array(items) => items,
            other => vec![other],
        };
        if let Some(product) = candidates.into_iter().find(is_product) {
            return Some(product);
        }
    }
    None
}

fn is_product(value: &Value) -> bool {
    match value.get("@type") {
        Some(Value::String(t)) => t == "Product",
        Some(Value::Array(types)) => types.iter().any(|t| t == "Product"),
        _ => false,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)?
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_offer(offers: &Value) -> Option<&Value> {
    match offers {
        Value::Array(list) => list.first(),
        Value::Object(_) => Some(offers),
        _ => None,
    }
}

fn number_field(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => parse_price_range(s).0,
        _ => None,
    }
}

/// Price range from `offers`: a single Offer, a list of Offers or an AggregateOffer
fn schema_price_range(product: &Value) -> Option<(Option<i64>, Option<i64>)> {
    let offers = product.get("offers")?;

    let prices: Vec<i64> = match offers {
        Value::Array(list) => list.iter().filter_map(|o| number_field(o, "price")).collect(),
        Value::Object(_) => {
            let low = number_field(offers, "lowPrice");
            let high = number_field(offers, "highPrice");
            if low.is_some() || high.is_some() {
                low.into_iter().chain(high).collect()
            } else {
                number_field(offers, "price").into_iter().collect()
            }
        }
        _ => Vec::new(),
    };

    if prices.is_empty() {
        return None;
    }
    Some((prices.iter().min().copied(), prices.iter().max().copied()))
}

fn schema_images(product: &Value) -> Vec<String> {
    match product.get("image") {
        Some(Value::String(url)) => vec![url.clone()],
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn first_text(document: &Html, css: &'static str) -> Option<String> {
    document
        .select(&selector(css))
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

/// Reads the value after an age label such as `対象年齢：R-18`
fn extract_age_rating(text: &str) -> Option<String> {
    let start = text.find(AGE_LABEL)? + AGE_LABEL.len();
    let value: String = text[start..]
        .trim_start_matches(|c: char| c == ':' || c == '：' || c.is_whitespace())
        .lines()
        .next()?
        .to_string();
    normalize_age_rating(&value)
}

/// Maps free-form age labels onto `R-18`, `R-15` or `all-ages`
pub fn normalize_age_rating(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.contains("18") {
        Some("R-18".to_string())
    } else if raw.contains("15") {
        Some("R-15".to_string())
    } else if raw.contains("全年齢") || raw.to_lowercase().contains("all ages") {
        Some("all-ages".to_string())
    } else {
        None
    }
}
