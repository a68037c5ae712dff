//! Chunk-to-page attribution.
//!
//! Signals are tried in priority order and the first proposal inside
//! `1..=page_count` wins. Proposals outside the document are skipped; if every
//! signal that fired was out of bounds, the highest-priority one is clamped at
//! minimum confidence. Page 1 is only used when no signal fired at all.

use once_cell::sync::Lazy;
use pagecite_core::model::{BlockKind, Chunk, DocumentLayout};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Share of a chunk the winning page must hold before it counts as single-page.
const SINGLE_PAGE_SHARE: f64 = 0.7;
const OVERLAP_ABSOLUTE_WEIGHT: f64 = 0.7;
const OVERLAP_RATIO_WEIGHT: f64 = 0.3;
const CLAMPED_CONFIDENCE: f32 = 0.1;
const CORROBORATION_BOOST: f32 = 0.1;
/// Structured markers must appear within this many leading characters.
const STRUCTURED_MARKER_WINDOW: usize = 120;

static IMAGE_PAGE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:image|figure|fig\.?|photo|scan|diagram)\s*(?:\d+\s*)?(?:[,:-]\s*)?(?:on\s+|from\s+)?(?:page|pg\.?|p\.)\s*(\d{1,5})\b",
    )
    .expect("image page marker regex is valid")
});

static STRUCTURED_PAGE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[\s\-=\[\(#*|]*(?:page|pg\.?)\s*(?:no\.?\s*)?(\d{1,5})\b")
        .expect("structured page marker regex is valid")
});

static LOOSE_PAGE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:page|pg\.?|p\.)\s*(\d{1,5})\b").expect("loose page marker regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    CharOverlap,
    ImageBlock,
    DeclaredValidated,
    DeclaredPage,
    ImageMarker,
    StructuredMarker,
    LooseMarker,
    OrdinalEstimate,
    Fallback,
}

impl ResolutionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionMethod::CharOverlap => "char_overlap",
            ResolutionMethod::ImageBlock => "image_block",
            ResolutionMethod::DeclaredValidated => "declared_validated",
            ResolutionMethod::DeclaredPage => "declared_page",
            ResolutionMethod::ImageMarker => "image_marker",
            ResolutionMethod::StructuredMarker => "structured_marker",
            ResolutionMethod::LooseMarker => "loose_marker",
            ResolutionMethod::OrdinalEstimate => "ordinal_estimate",
            ResolutionMethod::Fallback => "fallback",
        }
    }

    pub fn base_confidence(self) -> f32 {
        match self {
            ResolutionMethod::CharOverlap => 1.0,
            ResolutionMethod::DeclaredValidated => 0.9,
            ResolutionMethod::DeclaredPage => 0.8,
            ResolutionMethod::ImageBlock
            | ResolutionMethod::ImageMarker
            | ResolutionMethod::StructuredMarker => 0.6,
            ResolutionMethod::LooseMarker => 0.4,
            ResolutionMethod::OrdinalEstimate => 0.3,
            ResolutionMethod::Fallback => 0.1,
        }
    }

    fn family(self) -> SignalFamily {
        match self {
            ResolutionMethod::CharOverlap => SignalFamily::Overlap,
            ResolutionMethod::DeclaredValidated | ResolutionMethod::DeclaredPage => {
                SignalFamily::Declared
            }
            ResolutionMethod::ImageBlock
            | ResolutionMethod::ImageMarker
            | ResolutionMethod::StructuredMarker
            | ResolutionMethod::LooseMarker => SignalFamily::Marker,
            ResolutionMethod::OrdinalEstimate | ResolutionMethod::Fallback => SignalFamily::Other,
        }
    }
}

/// Independent evidence families used for corroboration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalFamily {
    Overlap,
    Declared,
    Marker,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageResolution {
    pub page: u32,
    pub confidence: f32,
    pub method: ResolutionMethod,
    pub clamped: bool,
    pub spans_multiple_pages: bool,
    pub corrections: Vec<String>,
}

/// One page proposed by one signal, before bounds validation.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Proposal {
    page: i64,
    method: ResolutionMethod,
    spans_multiple_pages: bool,
}

impl Proposal {
    fn new(page: impl Into<i64>, method: ResolutionMethod) -> Self {
        Self {
            page: page.into(),
            method,
            spans_multiple_pages: false,
        }
    }

    fn within(&self, page_count: u32) -> bool {
        (1..=i64::from(page_count)).contains(&self.page)
    }
}

type Signal = fn(&Chunk, &DocumentLayout) -> Option<Proposal>;

/// Priority order. Earlier entries win whenever they validate.
const CASCADE: [Signal; 8] = [
    char_overlap_signal,
    declared_validated_signal,
    declared_signal,
    image_block_signal,
    image_marker_signal,
    structured_marker_signal,
    loose_marker_signal,
    ordinal_signal,
];

pub struct PageResolver;

impl PageResolver {
    pub fn resolve(chunk: &Chunk, layout: &DocumentLayout) -> PageResolution {
        let page_count = layout.page_count();
        let proposals: Vec<Proposal> = CASCADE
            .iter()
            .filter_map(|signal| signal(chunk, layout))
            .collect();

        let Some(first) = proposals.first().copied() else {
            debug!(chunk_id = chunk.id, "no page signal, falling back to page 1");
            return PageResolution {
                page: 1,
                confidence: ResolutionMethod::Fallback.base_confidence(),
                method: ResolutionMethod::Fallback,
                clamped: false,
                spans_multiple_pages: false,
                corrections: Vec::new(),
            };
        };

        let Some(chosen) = proposals.iter().find(|p| p.within(page_count)).copied() else {
            let page = first.page.clamp(1, i64::from(page_count)) as u32;
            let correction = format!(
                "{} proposed page {} outside 1..={}, clamped to {}",
                first.method.as_str(),
                first.page,
                page_count,
                page
            );
            warn!(
                chunk_id = chunk.id,
                document_id = %chunk.document_id,
                method = first.method.as_str(),
                proposed = first.page,
                page,
                "page clamped into document bounds"
            );
            return PageResolution {
                page,
                confidence: first.method.base_confidence().min(CLAMPED_CONFIDENCE),
                method: first.method,
                clamped: true,
                spans_multiple_pages: first.spans_multiple_pages,
                corrections: vec![correction],
            };
        };

        for skipped in proposals.iter().take_while(|p| **p != chosen) {
            debug!(
                chunk_id = chunk.id,
                method = skipped.method.as_str(),
                proposed = skipped.page,
                "page signal out of bounds, skipped"
            );
        }

        let mut confidence = chosen.method.base_confidence();
        if corroborating_families(&proposals, &chosen, page_count) >= 2 {
            confidence = (confidence + CORROBORATION_BOOST).min(1.0);
        }

        if chosen.spans_multiple_pages {
            debug!(
                chunk_id = chunk.id,
                document_id = %chunk.document_id,
                page = chosen.page,
                "spans_multiple_pages"
            );
        }

        PageResolution {
            page: chosen.page as u32,
            confidence,
            method: chosen.method,
            clamped: false,
            spans_multiple_pages: chosen.spans_multiple_pages,
            corrections: Vec::new(),
        }
    }
}

/// Number of distinct overlap/declared/marker families that back the chosen page.
fn corroborating_families(proposals: &[Proposal], chosen: &Proposal, page_count: u32) -> usize {
    let mut agreeing = 0;
    let mut seen = Vec::with_capacity(3);
    // The first valid proposal of each family speaks for that family.
    for proposal in proposals.iter().filter(|p| p.within(page_count)) {
        let family = proposal.method.family();
        if family == SignalFamily::Other || seen.contains(&family) {
            continue;
        }
        seen.push(family);
        if proposal.page == chosen.page {
            agreeing += 1;
        }
    }
    agreeing
}

fn image_block_signal(chunk: &Chunk, layout: &DocumentLayout) -> Option<Proposal> {
    if !chunk.is_image_derived {
        return None;
    }
    let image_index = chunk.image_index?;
    layout
        .blocks
        .iter()
        .filter(|block| block.kind == BlockKind::Image && block.image_index == Some(image_index))
        .map(|block| block.page_number)
        .min()
        .map(|page| Proposal::new(page, ResolutionMethod::ImageBlock))
}

fn char_overlap_signal(chunk: &Chunk, layout: &DocumentLayout) -> Option<Proposal> {
    let chunk_len = chunk.char_len();
    if chunk_len == 0 {
        return layout
            .blocks
            .iter()
            .filter(|block| block.contains(chunk.char_start))
            .map(|block| block.page_number)
            .min()
            .map(|page| Proposal::new(page, ResolutionMethod::CharOverlap));
    }

    let mut per_page: BTreeMap<u32, u64> = BTreeMap::new();
    for block in &layout.blocks {
        let overlap = block.overlap(chunk.char_start, chunk.char_end);
        if overlap > 0 {
            *per_page.entry(block.page_number).or_insert(0) += overlap;
        }
    }
    let max_overlap = per_page.values().copied().max()?;

    let mut best: Option<(u32, u64, f64)> = None;
    // BTreeMap iterates pages ascending, so strict `>` keeps the lower page on ties.
    for (page, overlap) in &per_page {
        let absolute = *overlap as f64 / max_overlap as f64;
        let ratio = (*overlap as f64 / chunk_len as f64).min(1.0);
        let score = OVERLAP_ABSOLUTE_WEIGHT * absolute + OVERLAP_RATIO_WEIGHT * ratio;
        if best.map_or(true, |(_, _, best_score)| score > best_score) {
            best = Some((*page, *overlap, score));
        }
    }

    let (page, overlap, _) = best?;
    let share = overlap as f64 / chunk_len as f64;
    Some(Proposal {
        page: i64::from(page),
        method: ResolutionMethod::CharOverlap,
        spans_multiple_pages: per_page.len() > 1 && share < SINGLE_PAGE_SHARE,
    })
}

fn declared_validated_signal(chunk: &Chunk, layout: &DocumentLayout) -> Option<Proposal> {
    let declared = chunk.declared_page?;
    layout
        .blocks
        .iter()
        .any(|block| block.page_number == declared)
        .then(|| Proposal::new(declared, ResolutionMethod::DeclaredValidated))
}

fn declared_signal(chunk: &Chunk, _layout: &DocumentLayout) -> Option<Proposal> {
    chunk
        .declared_page
        .map(|page| Proposal::new(page, ResolutionMethod::DeclaredPage))
}

fn image_marker_signal(chunk: &Chunk, _layout: &DocumentLayout) -> Option<Proposal> {
    if !chunk.is_image_derived {
        return None;
    }
    first_marker(&IMAGE_PAGE_MARKER, &chunk.text)
        .map(|page| Proposal::new(page, ResolutionMethod::ImageMarker))
}

fn structured_marker_signal(chunk: &Chunk, _layout: &DocumentLayout) -> Option<Proposal> {
    first_marker(&STRUCTURED_PAGE_MARKER, leading_window(&chunk.text))
        .map(|page| Proposal::new(page, ResolutionMethod::StructuredMarker))
}

fn loose_marker_signal(chunk: &Chunk, _layout: &DocumentLayout) -> Option<Proposal> {
    first_marker(&LOOSE_PAGE_MARKER, &chunk.text)
        .map(|page| Proposal::new(page, ResolutionMethod::LooseMarker))
}

fn ordinal_signal(chunk: &Chunk, layout: &DocumentLayout) -> Option<Proposal> {
    let ordinal = chunk.ordinal?;
    let chunk_count = layout.chunk_count()?;
    let page_count = layout.page_count();
    let estimate = (f64::from(ordinal) / f64::from(chunk_count) * f64::from(page_count)).floor();
    Some(Proposal::new(estimate as i64 + 1, ResolutionMethod::OrdinalEstimate))
}

fn first_marker(pattern: &Regex, text: &str) -> Option<i64> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|digits| digits.as_str().parse().ok())
}

fn leading_window(text: &str) -> &str {
    match text.char_indices().nth(STRUCTURED_MARKER_WINDOW) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
