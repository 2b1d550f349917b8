use std::io::Write;

use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    catalog::{AnswerSet, Catalog, QUESTION_COUNT, Question, ResourceKind},
    content::Paragraphs,
    error::Result,
    figurine,
    printer::{Printer, Style},
};

pub const FOOTER: &str = "Come back and meet the other 26999.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlipRecord {
    pub slip_uuid: Uuid,
    pub figurine_id: u32,
    pub answer_indices: [usize; QUESTION_COUNT],
    pub paragraph1: String,
    pub paragraph2: String,
    pub resources_tools: String,
    pub resources_places: String,
    pub resources_programs: String,
    pub generated_at: DateTime<Utc>,
    pub used_fallback: bool,
    pub printed: bool,
    pub uploaded: bool,
}

impl SlipRecord {
    pub fn new(catalog: &Catalog, set: &AnswerSet, paragraphs: &Paragraphs) -> Self {
        let figurine_id = figurine::encode(set.indices());
        Self {
            slip_uuid: Uuid::new_v4(),
            figurine_id,
            answer_indices: set.indices(),
            paragraph1: paragraphs.first.clone(),
            paragraph2: paragraphs.second.clone(),
            resources_tools: gather(catalog, set, ResourceKind::Tools),
            resources_places: gather(catalog, set, ResourceKind::Places),
            resources_programs: gather(catalog, set, ResourceKind::Programs),
            generated_at: Utc::now(),
            used_fallback: paragraphs.used_fallback,
            printed: false,
            uploaded: false,
        }
    }
}

/// Joins the non-empty resource strings of all six answers, one per line.
fn gather(catalog: &Catalog, set: &AnswerSet, kind: ResourceKind) -> String {
    Question::ALL
        .iter()
        .map(|&question| catalog.resource(question, set.index_of(question), kind))
        .filter(|entry| !entry.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug)]
pub enum PageElement {
    Text { line: String, style: Style },
    Figurine(GrayImage),
    QrCode { payload: String, size: u8 },
    Feed(u8),
    Cut,
}

/// One composed receipt, ready to hand to the printer.
#[derive(Debug)]
pub struct Page {
    elements: Vec<PageElement>,
}

pub fn compose_page(
    record: &SlipRecord,
    title: &str,
    banner: &str,
    figurine: GrayImage,
    gallery_url: &str,
) -> Page {
    let mut elements = vec![
        PageElement::Text {
            line: banner.to_string(),
            style: Style::Title,
        },
        PageElement::Feed(2),
        PageElement::Figurine(figurine),
        PageElement::Text {
            line: title.to_string(),
            style: Style::Wide,
        },
        PageElement::Text {
            line: format!(
                "{} of {}",
                record.figurine_id,
                figurine::FIGURINE_COUNT
            ),
            style: Style::Bold,
        },
        PageElement::Feed(1),
        PageElement::Text {
            line: record.paragraph1.clone(),
            style: Style::Normal,
        },
        PageElement::Feed(1),
        PageElement::Text {
            line: record.paragraph2.clone(),
            style: Style::Normal,
        },
        PageElement::Feed(1),
    ];

    for (header, block) in [
        ("TOOLS", &record.resources_tools),
        ("PLACES", &record.resources_places),
        ("PROGRAMS", &record.resources_programs),
    ] {
        if block.is_empty() {
            continue;
        }
        elements.push(PageElement::Text {
            line: header.to_string(),
            style: Style::Bold,
        });
        elements.push(PageElement::Text {
            line: block.clone(),
            style: Style::Normal,
        });
    }

    elements.push(PageElement::QrCode {
        payload: format!(
            "{gallery_url}?data_id={}&figure_id={}",
            record.slip_uuid, record.figurine_id
        ),
        size: 6,
    });
    elements.push(PageElement::Text {
        line: FOOTER.to_string(),
        style: Style::Normal,
    });
    elements.push(PageElement::Cut);

    Page { elements }
}

impl Page {
    pub fn elements(&self) -> &[PageElement] {
        &self.elements
    }

    pub fn print<W: Write + Send>(&self, printer: &mut Printer<W>) -> Result<()> {
        for element in &self.elements {
            match element {
                PageElement::Text { line, style } => printer.text(line, *style),
                PageElement::Figurine(bitmap) => printer.image(bitmap),
                PageElement::QrCode { payload, size } => printer.qrcode(payload, *size),
                PageElement::Feed(lines) => printer.feed(*lines),
                PageElement::Cut => printer.cut()?,
            }
        }
        Ok(())
    }
}
