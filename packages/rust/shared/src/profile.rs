//! Structural queries describing one source's markup.
//!
//! Every field is an ordered list of independent strategies, tried until one
//! succeeds. The defaults describe the reference source; a `[profile]` table in
//! the config file replaces any list wholesale. Compilation into CSS selectors
//! and regexes happens in the crawler crate.

use serde::{Deserialize, Serialize};

/// One way of resolving a text field from a parsed page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldStrategy {
    /// Trimmed text of the first element matching `selector`.
    Text { selector: String },
    /// First non-empty attribute (in `attrs` order) on the first match.
    Attr { selector: String, attrs: Vec<String> },
    /// `<meta property|name=...>` content.
    Meta { name: String },
    /// Smallest block whose text contains `label`; its first link's text,
    /// or the text following the label.
    LabeledLink { label: String },
}

impl FieldStrategy {
    fn text(selector: &str) -> Self {
        Self::Text {
            selector: selector.into(),
        }
    }

    fn attr(selector: &str, attrs: &[&str]) -> Self {
        Self::Attr {
            selector: selector.into(),
            attrs: attrs.iter().map(|a| (*a).into()).collect(),
        }
    }

    fn meta(name: &str) -> Self {
        Self::Meta { name: name.into() }
    }

    fn labeled(label: &str) -> Self {
        Self::LabeledLink {
            label: label.into(),
        }
    }
}

/// Order in which an entry page lists its unit anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingOrder {
    NewestFirst,
    OldestFirst,
}

/// Complete structural description of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceProfile {
    /// Selectors for entry anchors on listing pages, highest priority first.
    pub entry_anchor_selectors: Vec<String>,
    /// Regex an entry URL path must match; also drives the all-links fallback.
    pub entry_path_pattern: String,

    pub title: Vec<FieldStrategy>,
    pub author: Vec<FieldStrategy>,
    pub description: Vec<FieldStrategy>,
    pub thumbnail: Vec<FieldStrategy>,
    /// Highest unit number the entry page advertises (a hint, never trusted).
    pub latest_unit: Vec<FieldStrategy>,

    /// Selectors for unit anchors on entry pages, highest priority first.
    pub unit_link_selectors: Vec<String>,
    /// Regex a unit URL must match; also drives the all-links fallback.
    pub unit_path_pattern: String,
    pub unit_listing_order: ListingOrder,

    /// Selectors for asset images on unit pages, highest priority first.
    pub asset_selectors: Vec<String>,
    /// Attributes read for an asset URL, in order.
    pub asset_attrs: Vec<String>,
    /// Substrings marking non-content assets (icons, logos, favicons).
    pub asset_blacklist: Vec<String>,

    /// Unit URL template for numeric probing; `{entry}`, `{slug}`, `{n}`.
    pub unit_url_template: String,
    /// Unit name template for numeric probing; `{n}`.
    pub unit_name_template: String,
}

impl Default for SourceProfile {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();

        Self {
            entry_anchor_selectors: strings(&[
                "div.story-item h3.story-name a",
                ".list-truyen-item a",
                "h3.title a",
                "div.item > a",
                "div.item figcaption h3 a",
            ]),
            entry_path_pattern: r"^/(manga|truyen-tranh)/[^/]+/?$".into(),

            title: vec![
                FieldStrategy::text("h1.title-detail"),
                FieldStrategy::text("h1"),
                FieldStrategy::meta("og:title"),
            ],
            author: vec![
                FieldStrategy::text("p.author a"),
                FieldStrategy::text("a.author"),
                FieldStrategy::text(".author span"),
                FieldStrategy::labeled("Tác giả"),
                FieldStrategy::labeled("Author"),
            ],
            description: vec![
                FieldStrategy::text("div.detail-content p"),
                FieldStrategy::text(".detail-content"),
                FieldStrategy::text(".summary_content"),
                FieldStrategy::text(".summary"),
                FieldStrategy::text(".story-intro"),
                FieldStrategy::meta("og:description"),
            ],
            thumbnail: vec![
                FieldStrategy::attr(".col-image img", &["src", "data-src"]),
                FieldStrategy::attr("div.detail-info img", &["src", "data-src"]),
                FieldStrategy::attr(".info-image img", &["src", "data-src"]),
                FieldStrategy::attr("img[itemprop='image']", &["src", "data-src"]),
                FieldStrategy::meta("og:image"),
            ],
            latest_unit: vec![
                FieldStrategy::text(".latest-chapter a"),
                FieldStrategy::text("a.last-chapter"),
            ],

            unit_link_selectors: strings(&[
                ".list-chapter li a",
                "div.list-chapter a",
                "ul.row-content-chapter li a",
                ".chapter_list a",
                ".chapter-list a",
                ".chapters a",
            ]),
            unit_path_pattern: r"(?i)chap(ter)?[-_/]?\d+".into(),
            unit_listing_order: ListingOrder::NewestFirst,

            asset_selectors: strings(&[
                ".reading-detail img",
                ".chapter-content img",
                "div.page-chapter img",
                ".container-chapter-reader img",
                "img.img-responsive",
                "img",
            ]),
            asset_attrs: strings(&["data-src", "data-original", "src"]),
            asset_blacklist: strings(&["/logo", "favicon", "icon"]),

            unit_url_template: "{entry}/chapter-{n}".into(),
            unit_name_template: "Chapter {n}".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_roundtrip_through_toml() {
        let profile = SourceProfile::default();
        let toml_str = toml::to_string_pretty(&profile).expect("serialize profile");
        let parsed: SourceProfile = toml::from_str(&toml_str).expect("deserialize profile");
        assert_eq!(parsed, profile);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let toml_str = r#"
unit_listing_order = "oldest_first"

[[title]]
kind = "text"
selector = "h2.name"
"#;
        let parsed: SourceProfile = toml::from_str(toml_str).expect("parse");
        assert_eq!(parsed.unit_listing_order, ListingOrder::OldestFirst);
        assert_eq!(
            parsed.title,
            vec![FieldStrategy::Text {
                selector: "h2.name".into()
            }]
        );
        assert_eq!(parsed.asset_attrs, SourceProfile::default().asset_attrs);
    }
}
