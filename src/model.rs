//! Label document model: what goes on a label and how the label is fed.
//!
//! Geometry conventions:
//! - label width/length are millimetres, measured before media rotation
//! - element position and size are typographic points (1/72 inch)
//! - spacing values are printer dots

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Points per inch.
pub const POINTS_PER_INCH: f32 = 72.0;
/// Millimetres per inch.
pub const MM_PER_INCH: f32 = 25.4;

bitflags! {
    /// Text decoration bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FontStyle: u8 {
        const BOLD = 0b0001;
        const ITALIC = 0b0010;
        const UNDERLINE = 0b0100;
        const STRIKETHROUGH = 0b1000;
    }
}

impl Serialize for FontStyle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for FontStyle {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

impl FontStyle {
    /// Map single-valued integer style codes
    /// (0 normal, 1 bold, 2 italic, 3 underline, 4 strikethrough).
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::BOLD,
            2 => Self::ITALIC,
            3 => Self::UNDERLINE,
            4 => Self::STRIKETHROUGH,
            _ => Self::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
}

/// How the printer finds the start of each label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperType {
    /// Die-cut labels separated by a gap.
    #[default]
    Gap,
    /// Continuous stock with a printed black mark.
    BlackMark,
    /// Black mark measured with the caliper sensor.
    BlackMarkCaliper,
}

impl PaperType {
    /// Wire code (1 gap, 4 black mark, 5 black mark caliper).
    pub fn code(self) -> u8 {
        match self {
            Self::Gap => 1,
            Self::BlackMark => 4,
            Self::BlackMarkCaliper => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Gap),
            4 => Some(Self::BlackMark),
            5 => Some(Self::BlackMarkCaliper),
            _ => None,
        }
    }
}

/// Orientation of the label stock relative to the design.
///
/// Only the four right angles exist at job level; element rotation is
/// continuous and lives on [`PrintElement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MediaRotation {
    #[default]
    #[serde(rename = "0")]
    Deg0,
    #[serde(rename = "90")]
    Deg90,
    #[serde(rename = "180")]
    Deg180,
    #[serde(rename = "270")]
    Deg270,
}

impl MediaRotation {
    /// Vendor code: 1 = 0°, 2 = 90°, 3 = 180°, 4 = 270°.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Deg0),
            2 => Some(Self::Deg90),
            3 => Some(Self::Deg180),
            4 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Deg0 => 1,
            Self::Deg90 => 2,
            Self::Deg180 => 3,
            Self::Deg270 => 4,
        }
    }

    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether this rotation swaps the printable width and length.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// What an element draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementContent {
    Text { text: String },
    /// Image downloaded from `url` before rasterizing.
    RemoteImage { url: String },
    /// Encoded image bytes (PNG, JPEG, WebP).
    LocalImage { bytes: Vec<u8> },
}

impl ElementContent {
    pub fn is_image(&self) -> bool {
        !matches!(self, Self::Text { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FontSpec {
    /// Face registered in the [`FontBook`](crate::font::FontBook); unknown names use the default face.
    pub name: String,
    /// Size in points.
    pub size: f32,
    pub style: FontStyle,
    /// Vertical glyph scale, 0.0–1.0 of the nominal size (0 means unscaled).
    pub height_ratio: f32,
}

impl Default for FontSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 10.0,
            style: FontStyle::empty(),
            height_ratio: 0.0,
        }
    }
}

/// One drawable item on a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintElement {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Clockwise degrees about the element centre.
    #[serde(default)]
    pub rotation: f32,
    #[serde(flatten)]
    pub content: ElementContent,
    #[serde(default)]
    pub font: FontSpec,
    #[serde(default)]
    pub alignment: Alignment,
    #[serde(default)]
    pub char_spacing: i32,
    #[serde(default)]
    pub line_spacing: i32,
    /// Draw white content on a black box.
    #[serde(default)]
    pub inverted: bool,
    /// Shrink or grow the font so the text fills the box without overflow.
    #[serde(default)]
    pub auto_size: bool,
    /// Wrap text at word boundaries to the box width.
    #[serde(default = "default_true")]
    pub wrap: bool,
}

fn default_true() -> bool {
    true
}

impl PrintElement {
    fn with_content(x: f32, y: f32, width: f32, height: f32, content: ElementContent) -> Self {
        Self {
            x,
            y,
            width,
            height,
            rotation: 0.0,
            content,
            font: FontSpec::default(),
            alignment: Alignment::Left,
            char_spacing: 0,
            line_spacing: 0,
            inverted: false,
            auto_size: false,
            wrap: true,
        }
    }

    pub fn text(x: f32, y: f32, width: f32, height: f32, text: impl Into<String>) -> Self {
        Self::with_content(x, y, width, height, ElementContent::Text { text: text.into() })
    }

    pub fn local_image(x: f32, y: f32, width: f32, height: f32, bytes: Vec<u8>) -> Self {
        Self::with_content(x, y, width, height, ElementContent::LocalImage { bytes })
    }

    pub fn remote_image(x: f32, y: f32, width: f32, height: f32, url: impl Into<String>) -> Self {
        Self::with_content(x, y, width, height, ElementContent::RemoteImage { url: url.into() })
    }

    pub fn rotated(mut self, degrees: f32) -> Self {
        self.rotation = degrees;
        self
    }

    pub fn inverted(mut self, inverted: bool) -> Self {
        self.inverted = inverted;
        self
    }

    pub fn aligned(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn font(mut self, font: FontSpec) -> Self {
        self.font = font;
        self
    }

    pub fn auto_size(mut self, auto_size: bool) -> Self {
        self.auto_size = auto_size;
        self
    }

    fn validate(&self, index: usize) -> Result<()> {
        let geometry = [self.x, self.y, self.width, self.height, self.rotation];
        if geometry.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidJob(format!("element {index}: non-finite geometry")));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(Error::InvalidJob(format!("element {index}: empty box")));
        }
        if self.x < 0.0 || self.y < 0.0 {
            return Err(Error::InvalidJob(format!("element {index}: negative position")));
        }
        if !self.font.size.is_finite() || self.font.size < 0.0 {
            return Err(Error::InvalidJob(format!("element {index}: bad font size")));
        }
        if !(0.0..=1.0).contains(&self.font.height_ratio) {
            return Err(Error::InvalidJob(format!("element {index}: height ratio out of range")));
        }
        Ok(())
    }
}

/// One page of a multi-page job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintPage {
    /// Page width in mm; `None` uses the job's label width.
    pub width_mm: Option<u32>,
    /// Page length in mm; `None` uses the job's label length.
    pub length_mm: Option<u32>,
    /// Times this page prints per job copy.
    pub repeat: u32,
    pub elements: Vec<PrintElement>,
}

impl Default for PrintPage {
    fn default() -> Self {
        Self {
            width_mm: None,
            length_mm: None,
            repeat: 1,
            elements: Vec::new(),
        }
    }
}

impl PrintPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sized(mut self, width_mm: u32, length_mm: u32) -> Self {
        self.width_mm = Some(width_mm);
        self.length_mm = Some(length_mm);
        self
    }

    pub fn repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_element(mut self, element: PrintElement) -> Self {
        self.elements.push(element);
        self
    }
}

/// A complete print job.
///
/// A job is either a single label described by `width_mm`, `length_mm` and
/// `elements`, or a list of `pages` that each carry their own elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintJobConfig {
    /// Label width in mm, before rotation.
    pub width_mm: u32,
    /// Label length in mm, before rotation.
    pub length_mm: u32,
    pub paper_type: PaperType,
    /// Let the printer detect label stock itself.
    pub auto_detect: bool,
    /// Print density, 1–9.
    pub density: u8,
    pub copies: u32,
    /// Send and print each copy as its own page.
    pub one_by_one: bool,
    pub half_cut_depth: u8,
    /// Horizontal print position offset in mm.
    pub left_offset_mm: i32,
    /// Vertical print position offset in mm.
    pub top_offset_mm: i32,
    /// Gap between labels in mm.
    pub gap_mm: u8,
    /// Extra feed after the last label in mm.
    pub tail_length_mm: u8,
    pub rotation: MediaRotation,
    pub dithering: crate::dithering::ImageDithering,
    pub elements: Vec<PrintElement>,
    /// Multi-page content; replaces `elements` when non-empty.
    pub pages: Vec<PrintPage>,
}

impl Default for PrintJobConfig {
    fn default() -> Self {
        Self {
            width_mm: 40,
            length_mm: 30,
            paper_type: PaperType::Gap,
            auto_detect: true,
            density: 3,
            copies: 1,
            one_by_one: true,
            half_cut_depth: 0,
            left_offset_mm: 0,
            top_offset_mm: 0,
            gap_mm: 3,
            tail_length_mm: 0,
            rotation: MediaRotation::Deg0,
            dithering: crate::dithering::ImageDithering::FloydSteinberg,
            elements: Vec::new(),
            pages: Vec::new(),
        }
    }
}

impl PrintJobConfig {
    pub fn new(width_mm: u32, length_mm: u32) -> Self {
        Self {
            width_mm,
            length_mm,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_element(mut self, element: PrintElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn with_page(mut self, page: PrintPage) -> Self {
        self.pages.push(page);
        self
    }

    /// Design-space size in mm: width and length swap for 90° and 270°.
    pub fn effective_size_mm(&self) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (self.length_mm, self.width_mm)
        } else {
            (self.width_mm, self.length_mm)
        }
    }

    /// Labels the whole job prints: every page repeat, times `copies`.
    pub fn total_labels(&self) -> u32 {
        let per_copy: u32 = if self.pages.is_empty() {
            1
        } else {
            self.pages.iter().fold(0u32, |sum, p| sum.saturating_add(p.repeat))
        };
        per_copy.saturating_mul(self.copies)
    }

    /// Split into single-page jobs, each paired with its repeat count.
    ///
    /// A job without `pages` is returned as its own only page.
    pub fn page_jobs(&self) -> Vec<(PrintJobConfig, u32)> {
        if self.pages.is_empty() {
            return vec![(self.clone(), 1)];
        }
        self.pages
            .iter()
            .map(|page| {
                let job = PrintJobConfig {
                    width_mm: page.width_mm.unwrap_or(self.width_mm),
                    length_mm: page.length_mm.unwrap_or(self.length_mm),
                    elements: page.elements.clone(),
                    ..self.settings()
                };
                (job, page.repeat)
            })
            .collect()
    }

    /// Feed and media settings without any content.
    fn settings(&self) -> PrintJobConfig {
        PrintJobConfig {
            width_mm: self.width_mm,
            length_mm: self.length_mm,
            paper_type: self.paper_type,
            auto_detect: self.auto_detect,
            density: self.density,
            copies: self.copies,
            one_by_one: self.one_by_one,
            half_cut_depth: self.half_cut_depth,
            left_offset_mm: self.left_offset_mm,
            top_offset_mm: self.top_offset_mm,
            gap_mm: self.gap_mm,
            tail_length_mm: self.tail_length_mm,
            rotation: self.rotation,
            dithering: self.dithering,
            elements: Vec::new(),
            pages: Vec::new(),
        }
    }

    /// Every element of the job, across pages.
    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut PrintElement> {
        self.elements
            .iter_mut()
            .chain(self.pages.iter_mut().flat_map(|p| p.elements.iter_mut()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.width_mm == 0 || self.length_mm == 0 {
            return Err(Error::InvalidJob("label size must be non-zero".into()));
        }
        if !(1..=9).contains(&self.density) {
            return Err(Error::InvalidJob(format!("density {} outside 1..=9", self.density)));
        }
        if self.copies == 0 {
            return Err(Error::InvalidJob("copies must be at least 1".into()));
        }
        if self.copies > u16::MAX as u32 {
            return Err(Error::InvalidJob(format!("too many copies: {}", self.copies)));
        }
        if !self.pages.is_empty() && !self.elements.is_empty() {
            return Err(Error::InvalidJob("a job has either elements or pages, not both".into()));
        }
        for (i, element) in self.elements.iter().enumerate() {
            element.validate(i)?;
        }
        for (p, page) in self.pages.iter().enumerate() {
            if page.width_mm == Some(0) || page.length_mm == Some(0) {
                return Err(Error::InvalidJob(format!("page {p}: size must be non-zero")));
            }
            if page.repeat == 0 {
                return Err(Error::InvalidJob(format!("page {p}: repeat must be at least 1")));
            }
            if page.repeat.saturating_mul(self.copies) > u16::MAX as u32 {
                return Err(Error::InvalidJob(format!("page {p}: too many labels")));
            }
            for (i, element) in page.elements.iter().enumerate() {
                element
                    .validate(i)
                    .map_err(|e| Error::InvalidJob(format!("page {p}, {}", strip_prefix(e))))?;
            }
        }
        Ok(())
    }
}

fn strip_prefix(error: Error) -> String {
    match error {
        Error::InvalidJob(reason) => reason,
        other => other.to_string(),
    }
}

/// Convert points to printer dots.
pub fn points_to_dots(points: f32, dots_per_mm: f32) -> f32 {
    points / POINTS_PER_INCH * MM_PER_INCH * dots_per_mm
}

/// Convert millimetres to printer dots, rounded to the nearest dot.
pub fn mm_to_dots(mm: i64, dots_per_mm: f32) -> i64 {
    (mm as f32 * dots_per_mm).round() as i64
}
