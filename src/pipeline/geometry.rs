//! Geometry reconciliation: OCR blocks → one non-duplicated Markdown document.
//!
//! OCR services report the same words twice on table-bearing pages: once as
//! free-standing `line` blocks and once as `table-cell` blocks. Only the
//! bounding boxes tell them apart. This module drops every line whose
//! top-left corner falls inside any table cell and rebuilds those words from
//! the cells instead, so each piece of text appears exactly once.
//!
//! The containment test is point-in-rectangle on the line's top-left corner,
//! not a rectangle overlap. Lines that straddle a table edge can therefore be
//! classified either way; this matches the behaviour the output format was
//! built around and is kept as-is.
//!
//! Everything here is a pure function of its input blocks.

use crate::pipeline::tables::escape_cell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Decimal digits kept when comparing boxes; absorbs OCR float jitter.
pub const BOX_PRECISION: i32 = 4;

/// Header that opens every OCR-derived document.
pub const DOCUMENT_HEADER: &str = "# Document Content\n\n";

/// A bounding box in page-relative coordinates (all values in 0–1).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(top: f64, left: f64, width: f64, height: f64) -> Self {
        Self {
            top,
            left,
            width,
            height,
        }
    }

    /// Every coordinate rounded to [`BOX_PRECISION`] decimal digits.
    pub fn rounded(&self) -> Self {
        let factor = 10f64.powi(BOX_PRECISION);
        let round = |v: f64| (v * factor).round() / factor;
        Self {
            top: round(self.top),
            left: round(self.left),
            width: round(self.width),
            height: round(self.height),
        }
    }

    /// Whether the top-left corner of `other` lies inside this box (edges included).
    pub fn contains_origin_of(&self, other: &BoundingBox) -> bool {
        self.top <= other.top
            && other.top <= self.top + self.height
            && self.left <= other.left
            && other.left <= self.left + self.width
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &BoundingBox) -> Self {
        let top = self.top.min(other.top);
        let left = self.left.min(other.left);
        let bottom = (self.top + self.height).max(other.top + other.height);
        let right = (self.left + self.width).max(other.left + other.width);
        Self::new(top, left, right - left, bottom - top)
    }
}

/// Where a table cell sits: table index on its page, then row and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellAddress {
    pub table: usize,
    pub row: usize,
    pub column: usize,
}

/// What an OCR block represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BlockRole {
    Line,
    TableCell {
        table: usize,
        row: usize,
        column: usize,
    },
}

/// One unit of OCR output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// 1-indexed page number.
    pub page: u32,
    pub text: String,
    #[serde(rename = "bbox")]
    pub bounding_box: BoundingBox,
    pub role: BlockRole,
}

impl TextBlock {
    pub fn line(page: u32, text: impl Into<String>, bounding_box: BoundingBox) -> Self {
        Self {
            page,
            text: text.into(),
            bounding_box,
            role: BlockRole::Line,
        }
    }

    pub fn cell(
        page: u32,
        text: impl Into<String>,
        bounding_box: BoundingBox,
        address: CellAddress,
    ) -> Self {
        Self {
            page,
            text: text.into(),
            bounding_box,
            role: BlockRole::TableCell {
                table: address.table,
                row: address.row,
                column: address.column,
            },
        }
    }

    pub fn cell_address(&self) -> Option<CellAddress> {
        match self.role {
            BlockRole::Line => None,
            BlockRole::TableCell { table, row, column } => Some(CellAddress { table, row, column }),
        }
    }
}

/// A table on one page: rows of cells in reading order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableBlock {
    pub rows: Vec<Vec<TextBlock>>,
}

impl TableBlock {
    /// Union of all cell boxes, or `None` for a table without cells.
    pub fn footprint(&self) -> Option<BoundingBox> {
        self.cells()
            .map(|c| c.bounding_box)
            .reduce(|acc, b| acc.union(&b))
    }

    pub fn cells(&self) -> impl Iterator<Item = &TextBlock> {
        self.rows.iter().flatten()
    }

    /// Cell boxes rounded for comparison.
    pub fn cell_boxes(&self) -> impl Iterator<Item = BoundingBox> + '_ {
        self.cells().map(|c| c.bounding_box.rounded())
    }
}

/// How multi-line cell text is written into a pipe-table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellFormat {
    /// Keep internal line structure, joined with `<br>`.
    #[default]
    Preserve,
    /// Collapse all whitespace to single spaces.
    Flatten,
}

/// The blocks of one page, split into free lines and tables.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageLayout {
    pub page: u32,
    pub lines: Vec<TextBlock>,
    pub tables: Vec<TableBlock>,
}

impl PageLayout {
    /// Group one page's blocks: lines keep their order, cells go to their
    /// table by address (tables ordered by index, rows and columns sorted).
    pub fn from_blocks(page: u32, blocks: impl IntoIterator<Item = TextBlock>) -> Self {
        let mut lines = Vec::new();
        let mut grid: BTreeMap<usize, BTreeMap<usize, Vec<(usize, TextBlock)>>> = BTreeMap::new();

        for block in blocks {
            match block.cell_address() {
                None => lines.push(block),
                Some(addr) => grid
                    .entry(addr.table)
                    .or_default()
                    .entry(addr.row)
                    .or_default()
                    .push((addr.column, block)),
            }
        }

        let tables = grid
            .into_values()
            .map(|rows| TableBlock {
                rows: rows
                    .into_values()
                    .map(|mut cells| {
                        cells.sort_by_key(|(column, _)| *column);
                        cells.into_iter().map(|(_, cell)| cell).collect()
                    })
                    .collect(),
            })
            .collect();

        Self {
            page,
            lines,
            tables,
        }
    }

    /// Lines whose top-left corner is not inside any table cell.
    pub fn free_lines(&self) -> Vec<&TextBlock> {
        let cell_boxes: Vec<BoundingBox> =
            self.tables.iter().flat_map(|t| t.cell_boxes()).collect();
        self.lines
            .iter()
            .filter(|line| !inside_any(&line.bounding_box, &cell_boxes))
            .collect()
    }

    /// Markdown for this page: free lines first, then `### Table N` sections.
    pub fn to_markdown(&self, format: CellFormat) -> String {
        let mut out = String::new();
        for line in self.free_lines() {
            out.push_str(&line.text);
            out.push_str("\n\n");
        }
        for (idx, table) in self.tables.iter().enumerate() {
            out.push_str(&format!("### Table {}\n\n", idx + 1));
            out.push_str(&render_table(table, format));
            out.push_str("\n\n");
        }
        out
    }
}

fn inside_any(line_box: &BoundingBox, cell_boxes: &[BoundingBox]) -> bool {
    let line_box = line_box.rounded();
    cell_boxes.iter().any(|cell| cell.contains_origin_of(&line_box))
}

/// Rows are padded or truncated to the header row's width.
fn render_table(table: &TableBlock, format: CellFormat) -> String {
    let width = table.rows.first().map_or(0, Vec::len);
    let mut out = String::new();
    for (r, row) in table.rows.iter().enumerate() {
        let mut cells: Vec<String> = row
            .iter()
            .take(width)
            .map(|cell| escape_cell(&format_cell(&cell.text, format)))
            .collect();
        cells.resize(width, String::new());
        out.push('|');
        for cell in cells {
            out.push(' ');
            out.push_str(&cell);
            out.push_str(" |");
        }
        out.push('\n');
        if r == 0 {
            out.push('|');
            out.push_str(&" --- |".repeat(width));
            out.push('\n');
        }
    }
    out
}

/// Multi-line cells keep their structure as `<br>`-joined lines.
pub fn format_cell(text: &str, format: CellFormat) -> String {
    match format {
        CellFormat::Flatten => text.split_whitespace().collect::<Vec<_>>().join(" "),
        CellFormat::Preserve => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("<br>"),
    }
}

/// Reconciled OCR output for a whole document.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledDocument {
    pub markdown: String,
    pub pages: usize,
    pub tables: usize,
}

/// Reconcile all blocks of a document into Markdown.
///
/// Pages are emitted in ascending page order. Every page after the first is
/// introduced by a horizontal rule and a `## Page N` heading.
pub fn reconcile(blocks: &[TextBlock], format: CellFormat) -> ReconciledDocument {
    let mut by_page: BTreeMap<u32, Vec<TextBlock>> = BTreeMap::new();
    for block in blocks {
        by_page.entry(block.page).or_default().push(block.clone());
    }

    let mut markdown = String::from(DOCUMENT_HEADER);
    let mut tables = 0;
    let pages = by_page.len();

    for (position, (page, page_blocks)) in by_page.into_iter().enumerate() {
        if position > 0 {
            markdown.push_str(&format!("\n---\n\n## Page {}\n\n", page));
        }
        let layout = PageLayout::from_blocks(page, page_blocks);
        tables += layout.tables.len();
        markdown.push_str(&layout.to_markdown(format));
    }

    ReconciledDocument {
        markdown,
        pages,
        tables,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(top: f64, left: f64, width: f64, height: f64) -> BoundingBox {
        BoundingBox::new(top, left, width, height)
    }

    fn cell(page: u32, text: &str, table: usize, row: usize, column: usize, b: BoundingBox) -> TextBlock {
        TextBlock::cell(page, text, b, CellAddress { table, row, column })
    }

    /// A 2×2 table in the lower half of the page plus the duplicate lines
    /// the OCR service reports for the same words.
    fn invoice_page() -> Vec<TextBlock> {
        vec![
            TextBlock::line(1, "Invoice 42", bb(0.05, 0.1, 0.3, 0.03)),
            TextBlock::line(1, "Item", bb(0.5, 0.1, 0.1, 0.02)),
            TextBlock::line(1, "Amount", bb(0.5, 0.5, 0.1, 0.02)),
            TextBlock::line(1, "Bolts", bb(0.55, 0.1, 0.1, 0.02)),
            TextBlock::line(1, "12.00", bb(0.55, 0.5, 0.1, 0.02)),
            TextBlock::line(1, "Thank you", bb(0.9, 0.1, 0.2, 0.02)),
            cell(1, "Item", 0, 0, 0, bb(0.5, 0.1, 0.4, 0.05)),
            cell(1, "Amount", 0, 0, 1, bb(0.5, 0.5, 0.4, 0.05)),
            cell(1, "Bolts", 0, 1, 0, bb(0.55, 0.1, 0.4, 0.05)),
            cell(1, "12.00", 0, 1, 1, bb(0.55, 0.5, 0.4, 0.05)),
        ]
    }

    #[test]
    fn rounding_absorbs_jitter() {
        let a = bb(0.123_449_99, 0.5, 0.25, 0.1).rounded();
        let b = bb(0.123_450_01, 0.5, 0.25, 0.1).rounded();
        assert!((a.top - 0.1234).abs() < 1e-12);
        assert!((b.top - 0.1235).abs() < 1e-12);
    }

    #[test]
    fn containment_is_top_left_point_in_rectangle() {
        let cell = bb(0.5, 0.25, 0.25, 0.125);
        assert!(cell.contains_origin_of(&bb(0.5, 0.25, 0.9, 0.9)));
        assert!(cell.contains_origin_of(&bb(0.625, 0.5, 0.0, 0.0)), "edges are inclusive");
        assert!(!cell.contains_origin_of(&bb(0.49, 0.3, 0.01, 0.01)));
        assert!(!cell.contains_origin_of(&bb(0.52, 0.51, 0.01, 0.01)));
    }

    #[test]
    fn table_lines_are_not_duplicated() {
        let doc = reconcile(&invoice_page(), CellFormat::Preserve);
        for word in ["Invoice 42", "Item", "Amount", "Bolts", "12.00", "Thank you"] {
            assert_eq!(doc.markdown.matches(word).count(), 1, "{word} in:\n{}", doc.markdown);
        }
        assert_eq!(doc.tables, 1);
        assert_eq!(doc.pages, 1);
    }

    #[test]
    fn page_renders_lines_then_tables() {
        let doc = reconcile(&invoice_page(), CellFormat::Preserve);
        let expected = "# Document Content\n\n\
                        Invoice 42\n\n\
                        Thank you\n\n\
                        ### Table 1\n\n\
                        | Item | Amount |\n\
                        | --- | --- |\n\
                        | Bolts | 12.00 |\n\n\n";
        assert_eq!(doc.markdown, expected);
    }

    #[test]
    fn page_breaks_only_between_pages() {
        let blocks = vec![
            TextBlock::line(2, "second", bb(0.1, 0.1, 0.1, 0.1)),
            TextBlock::line(1, "first", bb(0.1, 0.1, 0.1, 0.1)),
            TextBlock::line(3, "third", bb(0.1, 0.1, 0.1, 0.1)),
        ];
        let doc = reconcile(&blocks, CellFormat::Preserve);
        assert!(!doc.markdown.contains("## Page 1"));
        let p2 = doc.markdown.find("\n---\n\n## Page 2\n\nsecond").expect("page 2 marker");
        let p3 = doc.markdown.find("\n---\n\n## Page 3\n\nthird").expect("page 3 marker");
        assert!(doc.markdown.find("first").unwrap() < p2);
        assert!(p2 < p3);
    }

    #[test]
    fn reconcile_is_order_independent_across_pages() {
        let mut blocks = invoice_page();
        blocks.push(TextBlock::line(2, "Terms", bb(0.1, 0.1, 0.1, 0.1)));
        let forward = reconcile(&blocks, CellFormat::Preserve);
        let mut shuffled = blocks.clone();
        shuffled.rotate_left(6);
        let again = reconcile(&shuffled, CellFormat::Preserve);
        assert_eq!(forward, again);
    }

    #[test]
    fn cells_are_sorted_by_row_and_column() {
        let blocks = vec![
            cell(1, "d", 0, 1, 1, bb(0.2, 0.2, 0.1, 0.1)),
            cell(1, "a", 0, 0, 0, bb(0.1, 0.1, 0.1, 0.1)),
            cell(1, "c", 0, 1, 0, bb(0.2, 0.1, 0.1, 0.1)),
            cell(1, "b", 0, 0, 1, bb(0.1, 0.2, 0.1, 0.1)),
        ];
        let layout = PageLayout::from_blocks(1, blocks);
        let text: Vec<Vec<&str>> = layout.tables[0]
            .rows
            .iter()
            .map(|r| r.iter().map(|c| c.text.as_str()).collect())
            .collect();
        assert_eq!(text, vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[test]
    fn footprint_is_union_of_cells() {
        let layout = PageLayout::from_blocks(1, invoice_page());
        let fp = layout.tables[0].footprint().unwrap();
        assert!((fp.top - 0.5).abs() < 1e-9);
        assert!((fp.left - 0.1).abs() < 1e-9);
        assert!((fp.width - 0.8).abs() < 1e-9);
        assert!((fp.height - 0.1).abs() < 1e-9);
        assert!(TableBlock::default().footprint().is_none());
    }

    #[test]
    fn multi_line_cells() {
        assert_eq!(format_cell("Qty: 2\n  Unit: 5.00\n\n", CellFormat::Preserve), "Qty: 2<br>Unit: 5.00");
        assert_eq!(format_cell("Qty: 2\n  Unit:   5.00", CellFormat::Flatten), "Qty: 2 Unit: 5.00");
    }

    #[test]
    fn ragged_rows_match_header_width() {
        let blocks = vec![
            cell(1, "a", 0, 0, 0, bb(0.1, 0.1, 0.1, 0.1)),
            cell(1, "b", 0, 0, 1, bb(0.1, 0.2, 0.1, 0.1)),
            cell(1, "c", 0, 0, 2, bb(0.1, 0.3, 0.1, 0.1)),
            cell(1, "d", 0, 1, 0, bb(0.2, 0.1, 0.1, 0.1)),
            cell(1, "e", 0, 2, 0, bb(0.3, 0.1, 0.1, 0.1)),
            cell(1, "f", 0, 2, 1, bb(0.3, 0.2, 0.1, 0.1)),
            cell(1, "g", 0, 2, 2, bb(0.3, 0.3, 0.1, 0.1)),
            cell(1, "h", 0, 2, 3, bb(0.3, 0.4, 0.1, 0.1)),
        ];
        let doc = reconcile(&blocks, CellFormat::Preserve);
        assert!(
            doc.markdown.contains(
                "| a | b | c |\n| --- | --- | --- |\n| d |  |  |\n| e | f | g |\n"
            ),
            "{}",
            doc.markdown
        );
        for line in doc.markdown.lines().filter(|l| l.starts_with('|')) {
            assert_eq!(line.matches(" |").count(), 3, "{line}");
        }
    }

    #[test]
    fn cell_pipes_are_escaped() {
        let blocks = vec![cell(1, "a|b", 0, 0, 0, bb(0.1, 0.1, 0.1, 0.1))];
        let doc = reconcile(&blocks, CellFormat::Preserve);
        assert!(doc.markdown.contains("| a\\|b |"));
    }

    #[test]
    fn block_role_serialises_with_kind_tag() {
        let block = cell(1, "x", 0, 2, 3, bb(0.0, 0.0, 0.1, 0.1));
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["role"]["kind"], "table-cell");
        assert_eq!(json["role"]["row"], 2);
        let line: TextBlock = serde_json::from_str(
            r#"{"page":1,"text":"hi","bbox":{"top":0.1,"left":0.1,"width":0.2,"height":0.05},"role":{"kind":"line"}}"#,
        )
        .unwrap();
        assert_eq!(line.role, BlockRole::Line);
    }
}
