//! Offer extraction from the event page.
//!
//! Extraction never fails outright: missing fields become "Unknown" and a
//! page without recognisable listings comes back with no offers and
//! `degraded` set.

use crate::fetch::Document;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

pub const UNKNOWN: &str = "Unknown";

const EVENT_NAME: &str = "#eventName > span:nth-child(1)";
const VENUE: &str = "#venueName > span:nth-child(2)";
const CITY: &str = "#locationShortName > span:nth-child(1)";
const EVENT_DATE: &str = ".inline-datetime";
const NO_LISTINGS: &str = "#no-listings-found > div:nth-child(1) > p:nth-child(1) > span:nth-child(1)";
const NO_LISTINGS_TEXT: &str = "sorry, we don't currently have any tickets for this event";
const LISTING: &str = ".buy-button";
const LISTING_BUYABLE: &str = "twickets-listing.width-max div.result-row-buy";
const LISTING_PRICE: &str = "twickets-listing span strong:nth-child(2)";
const LISTING_TIER: &str = "[id^='listingPriceTier']";
const LISTING_QUANTITY: &str = "twickets-listing div:nth-child(2) span span";

/// One purchasable listing. Values are display text, already escaped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offer {
    pub price: String,
    pub quantity: String,
    pub kind: String,
}

impl Offer {
    pub fn new(price: impl Into<String>, quantity: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            price: price.into(),
            quantity: quantity.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub event_name: String,
    pub location: String,
    pub event_date: String,
    pub offers: Vec<Offer>,
    /// The page says outright that there are no tickets.
    pub no_offers_sentinel: bool,
    /// No listings container was found and the page did not say why.
    pub degraded: bool,
}

impl Default for ExtractionResult {
    fn default() -> Self {
        Self {
            event_name: UNKNOWN.to_string(),
            location: UNKNOWN.to_string(),
            event_date: UNKNOWN.to_string(),
            offers: Vec::new(),
            no_offers_sentinel: false,
            degraded: false,
        }
    }
}

pub trait Extractor: Send + Sync {
    fn extract(&self, document: &Document) -> ExtractionResult;
}

/// Selector-based extractor for the resale event page.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketPageExtractor;

impl Extractor for TicketPageExtractor {
    fn extract(&self, document: &Document) -> ExtractionResult {
        let html = Html::parse_document(&document.body);
        let root = html.root_element();

        let event_name = text_of(root, EVENT_NAME).unwrap_or_else(|| UNKNOWN.to_string());
        let location = match (text_of(root, VENUE), text_of(root, CITY)) {
            (Some(venue), Some(city)) => format!("{}, {}", venue, city),
            (Some(one), None) | (None, Some(one)) => one,
            (None, None) => UNKNOWN.to_string(),
        };
        let event_date = text_of(root, EVENT_DATE).unwrap_or_else(|| UNKNOWN.to_string());
        debug!(event = %event_name, location = %location, date = %event_date, "page metadata");

        let mut result = ExtractionResult {
            event_name,
            location,
            event_date,
            ..Default::default()
        };

        let sentinel = raw_text_of(root, NO_LISTINGS)
            .map(|t| t.to_lowercase().contains(NO_LISTINGS_TEXT))
            .unwrap_or(false);
        if sentinel {
            result.no_offers_sentinel = true;
            return result;
        }

        let Some(listing) = parse(LISTING) else {
            return result;
        };
        let listings: Vec<ElementRef> = root.select(&listing).collect();
        if listings.is_empty() {
            result.degraded = true;
            return result;
        }
        debug!(count = listings.len(), "listing rows found");

        let buyable = parse(LISTING_BUYABLE);
        for row in listings {
            let can_buy = buyable
                .as_ref()
                .map(|sel| row.select(sel).next().is_some())
                .unwrap_or(false);
            if !can_buy {
                continue;
            }
            result.offers.push(Offer {
                price: text_of(row, LISTING_PRICE).unwrap_or_else(|| UNKNOWN.to_string()),
                quantity: text_of(row, LISTING_QUANTITY).unwrap_or_else(|| UNKNOWN.to_string()),
                kind: text_of(row, LISTING_TIER).unwrap_or_else(|| UNKNOWN.to_string()),
            });
        }

        result
    }
}

fn parse(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn raw_text_of(scope: ElementRef<'_>, css: &str) -> Option<String> {
    let selector = parse(css)?;
    let element = scope.select(&selector).next()?;
    let text = element.text().collect::<String>();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Trimmed, escaped text of the first match; `None` if absent or blank.
fn text_of(scope: ElementRef<'_>, css: &str) -> Option<String> {
    raw_text_of(scope, css).map(|t| escape_html(&t))
}

/// Escape text for the channel's HTML parse mode.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &str) -> Document {
        Document {
            url: "https://example.test/event/1".into(),
            status: 200,
            body: body.into(),
        }
    }

    const HEADER: &str = r#"
        <div id="eventName"><span>Fontaines D.C. &amp; Friends</span></div>
        <div id="venueName"><span>at</span><span>O2 Academy</span></div>
        <div id="locationShortName"><span>Leeds</span></div>
        <div class="inline-datetime">Sat 14 Mar 2026</div>
    "#;

    fn listing(price: &str, qty: &str, tier: &str, buyable: bool) -> String {
        let buy = if buyable { r#"<div class="result-row-buy">Buy</div>"# } else { "" };
        format!(
            r#"<div class="buy-button">
                 <twickets-listing class="width-max">
                   <div><span>From <strong>x</strong><strong>{price}</strong></span></div>
                   <div><span>Qty <span>{qty}</span></span></div>
                   <p id="listingPriceTier1">{tier}</p>
                   {buy}
                 </twickets-listing>
               </div>"#
        )
    }

    #[test]
    fn test_extracts_metadata_and_offers() {
        let body = format!(
            "<html><body>{}{}{}</body></html>",
            HEADER,
            listing("£50", "2", "General Admission", true),
            listing("£75", "1", "Standing", false),
        );
        let result = TicketPageExtractor.extract(&doc(&body));

        assert_eq!(result.event_name, "Fontaines D.C. &amp; Friends");
        assert_eq!(result.location, "O2 Academy, Leeds");
        assert_eq!(result.event_date, "Sat 14 Mar 2026");
        assert_eq!(result.offers, vec![Offer::new("£50", "2", "General Admission")]);
        assert!(!result.no_offers_sentinel);
        assert!(!result.degraded);
    }

    #[test]
    fn test_missing_fields_default_to_unknown() {
        let body = r#"<div class="buy-button">
            <twickets-listing class="width-max"><div class="result-row-buy"></div></twickets-listing>
        </div>"#;
        let result = TicketPageExtractor.extract(&doc(body));

        assert_eq!(result.event_name, UNKNOWN);
        assert_eq!(result.location, UNKNOWN);
        assert_eq!(result.offers, vec![Offer::new(UNKNOWN, UNKNOWN, UNKNOWN)]);
    }

    #[test]
    fn test_no_listings_sentinel() {
        let body = format!(
            r#"{}<div id="no-listings-found"><div><p><span>Sorry, we don't currently have any tickets for this event.</span></p></div></div>"#,
            HEADER
        );
        let result = TicketPageExtractor.extract(&doc(&body));
        assert!(result.no_offers_sentinel);
        assert!(result.offers.is_empty());
        assert!(!result.degraded);
    }

    #[test]
    fn test_unrecognised_page_is_degraded() {
        let result = TicketPageExtractor.extract(&doc("<html><body>Loading...</body></html>"));
        assert!(result.degraded);
        assert!(result.offers.is_empty());
        assert!(!result.no_offers_sentinel);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html(r#"<b>"Tom" & 'Jerry'</b>"#), "&lt;b&gt;&quot;Tom&quot; &amp; &#x27;Jerry&#x27;&lt;/b&gt;");
    }
}
