use std::collections::HashSet;

use mime_guess::mime;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::normalize::normalize_reference;
use super::{ResourceKind, ResourceRef};

static RESOURCE_ELEMENTS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("img, source, video, audio, a[href]").expect("valid selector")
});

/// Extract the resources referenced by a post's HTML, in document order and
/// without duplicates.
#[must_use]
pub fn discover_resources(html: &str, base: &Url) -> Vec<ResourceRef> {
    let document = Html::parse_fragment(html);
    let mut seen = HashSet::new();
    let mut resources = Vec::new();

    for element in document.select(&RESOURCE_ELEMENTS) {
        for (reference, kind) in element_references(&element) {
            let Some(url) = normalize_reference(reference, base) else {
                continue;
            };
            if seen.insert(url.clone()) {
                resources.push(ResourceRef::new(url, kind));
            }
        }
    }

    resources
}

/// Split a `srcset` value into its candidate URLs.
fn srcset_candidates(srcset: &str) -> impl Iterator<Item = &str> {
    srcset
        .split(',')
        .filter_map(|candidate| candidate.split_whitespace().next())
}

/// References carried by one element, with the kind each should be stored as.
fn element_references<'a>(element: &ElementRef<'a>) -> Vec<(&'a str, ResourceKind)> {
    let el = element.value();
    let mut refs = Vec::new();

    match el.name() {
        "img" => {
            let kind = if has_class(element, "emoji") {
                ResourceKind::Emoji
            } else if has_class(element, "avatar") {
                ResourceKind::Avatar
            } else {
                ResourceKind::Image
            };
            if let Some(src) = el.attr("src") {
                refs.push((src, kind));
            }
            if let Some(srcset) = el.attr("srcset") {
                refs.extend(srcset_candidates(srcset).map(|url| (url, kind)));
            }
        }
        "source" | "video" | "audio" => {
            if let Some(src) = el.attr("src") {
                refs.push((src, ResourceKind::Video));
            }
            if let Some(srcset) = el.attr("srcset") {
                refs.extend(srcset_candidates(srcset).map(|url| (url, ResourceKind::Image)));
            }
            if let Some(poster) = el.attr("poster") {
                refs.push((poster, ResourceKind::Image));
            }
        }
        "a" => {
            if let Some(href) = el.attr("href") {
                if has_class(element, "attachment") {
                    refs.push((href, ResourceKind::Attachment));
                } else if let Some(kind) = media_kind(href) {
                    refs.push((href, kind));
                }
            }
        }
        _ => {}
    }

    refs
}

fn has_class(element: &ElementRef, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// Classify a link target as image or video media by its path.
///
/// Links to anything else (pages, profiles, other threads) are not resources
/// unless explicitly marked as attachments.
#[must_use]
pub fn media_kind(reference: &str) -> Option<ResourceKind> {
    let path = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference);
    let guess = mime_guess::from_path(path).first()?;
    let top = guess.type_();
    if top == mime::IMAGE {
        Some(ResourceKind::Image)
    } else if top == mime::VIDEO || top == mime::AUDIO {
        Some(ResourceKind::Video)
    } else {
        None
    }
}
