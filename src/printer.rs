use std::{fs::File, io::Write, path::Path};

use image::GrayImage;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Horizontal dot count of the receipt paper.
pub const PAGE_DOTS: u32 = 512;

const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Style {
    #[default]
    Normal,
    Bold,
    Wide,
    /// Centered, bold, double width and height. Used for the banner lines.
    Title,
}

impl Style {
    fn mode_byte(self) -> u8 {
        match self {
            Style::Normal => 0x00,
            Style::Bold => 0x08,
            Style::Wide => 0x30,
            Style::Title => 0x38,
        }
    }

    fn centered(self) -> bool {
        matches!(self, Style::Title)
    }
}

/// Buffered ESC/POS command stream. Nothing reaches the device until `cut`,
/// which terminates the page and flushes the whole buffer at once.
pub struct Printer<W: Write + Send> {
    sink: W,
    buf: Vec<u8>,
    page_started: bool,
}

impl Printer<File> {
    pub fn open(device: &Path) -> Result<Self> {
        let file = File::options()
            .write(true)
            .open(device)
            .map_err(|err| Error::DeviceUnavailable {
                device: "printer",
                reason: format!("cannot claim {}: {err}", device.display()),
            })?;
        info!("Printer on {}", device.display());
        Ok(Self::with_sink(file))
    }
}

impl<W: Write + Send> Printer<W> {
    pub fn with_sink(sink: W) -> Self {
        Self {
            sink,
            buf: Vec::new(),
            page_started: false,
        }
    }

    pub fn text(&mut self, line: &str, style: Style) {
        self.begin_page();
        self.buf.extend_from_slice(&[ESC, b'a', u8::from(style.centered())]);
        self.buf.extend_from_slice(&[ESC, b'!', style.mode_byte()]);
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(&[ESC, b'!', 0x00]);
        if style.centered() {
            self.buf.extend_from_slice(&[ESC, b'a', 0]);
        }
    }

    /// Raster bitmap, centered. Pixels darker than mid-gray print black.
    pub fn image(&mut self, bitmap: &GrayImage) {
        self.begin_page();
        let width_bytes = bitmap.width().div_ceil(8);
        let height = bitmap.height();

        self.buf.extend_from_slice(&[ESC, b'a', 1]);
        self.buf.extend_from_slice(&[GS, b'v', b'0', 0x00]);
        self.buf.extend_from_slice(&[
            (width_bytes & 0xFF) as u8,
            (width_bytes >> 8) as u8,
            (height & 0xFF) as u8,
            (height >> 8) as u8,
        ]);

        for y in 0..height {
            for byte_x in 0..width_bytes {
                let mut packed = 0u8;
                for bit in 0..8 {
                    let x = byte_x * 8 + bit;
                    if x < bitmap.width() && bitmap.get_pixel(x, y).0[0] < 0x80 {
                        packed |= 0x80 >> bit;
                    }
                }
                self.buf.push(packed);
            }
        }
        self.buf.extend_from_slice(&[ESC, b'a', 0]);
    }

    /// Printer-native QR symbol (GS ( k), centered.
    pub fn qrcode(&mut self, payload: &str, size: u8) {
        self.begin_page();
        self.buf.extend_from_slice(&[ESC, b'a', 1]);
        // model 2
        self.buf
            .extend_from_slice(&[GS, b'(', b'k', 4, 0, 0x31, 0x41, 0x32, 0x00]);
        // module size
        self.buf
            .extend_from_slice(&[GS, b'(', b'k', 3, 0, 0x31, 0x43, size.clamp(1, 16)]);
        // error correction M
        self.buf
            .extend_from_slice(&[GS, b'(', b'k', 3, 0, 0x31, 0x45, 0x31]);
        // store payload
        let store_len = payload.len() + 3;
        self.buf.extend_from_slice(&[
            GS,
            b'(',
            b'k',
            (store_len & 0xFF) as u8,
            (store_len >> 8) as u8,
            0x31,
            0x50,
            0x30,
        ]);
        self.buf.extend_from_slice(payload.as_bytes());
        // print
        self.buf
            .extend_from_slice(&[GS, b'(', b'k', 3, 0, 0x31, 0x51, 0x30]);
        self.buf.extend_from_slice(&[ESC, b'a', 0]);
    }

    pub fn feed(&mut self, lines: u8) {
        self.begin_page();
        self.buf.extend_from_slice(&[ESC, b'd', lines]);
    }

    /// Ends the page and pushes the buffered stream to the device.
    pub fn cut(&mut self) -> Result<()> {
        self.begin_page();
        self.buf.extend_from_slice(&[GS, b'V', 0x41, 0x10]);

        let page = std::mem::take(&mut self.buf);
        self.page_started = false;
        debug!("Flushing {} byte page to printer", page.len());

        self.sink
            .write_all(&page)
            .and_then(|()| self.sink.flush())
            .map_err(|err| Error::Printer(err.to_string()))
    }

    /// Hands the sink back, e.g. to inspect a captured dry-run page.
    pub fn into_sink(self) -> W {
        self.sink
    }

    /// Drops anything buffered for the current page.
    pub fn abandon_page(&mut self) {
        self.buf.clear();
        self.page_started = false;
    }

    fn begin_page(&mut self) {
        if !self.page_started {
            self.buf.extend_from_slice(&[ESC, b'@']);
            self.page_started = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn printer() -> Printer<Vec<u8>> {
        Printer::with_sink(Vec::new())
    }

    #[test]
    fn nothing_reaches_the_sink_before_cut() {
        let mut printer = printer();
        printer.text("hello", Style::Normal);
        printer.feed(2);
        assert!(printer.sink.is_empty());

        printer.cut().expect("flush to vec");
        assert!(!printer.sink.is_empty());
    }

    #[test]
    fn page_starts_with_init_and_ends_with_cut() {
        let mut printer = printer();
        printer.text("hello", Style::Normal);
        printer.cut().expect("flush to vec");

        assert_eq!(&printer.sink[..2], &[ESC, b'@']);
        assert_eq!(&printer.sink[printer.sink.len() - 4..], &[GS, b'V', 0x41, 0x10]);
    }

    #[test]
    fn text_line_carries_style_and_newline() {
        let mut printer = printer();
        printer.text("N of 27000", Style::Bold);
        printer.cut().expect("flush to vec");

        let page = printer.sink.clone();
        let needle = b"N of 27000\n";
        assert!(page.windows(needle.len()).any(|w| w == needle));
        assert!(page.windows(3).any(|w| w == [ESC, b'!', 0x08]));
    }

    #[test]
    fn image_header_encodes_row_bytes_and_height() {
        let mut printer = printer();
        let mut bitmap = GrayImage::from_pixel(16, 2, Luma([0xFF]));
        bitmap.put_pixel(0, 0, Luma([0x00]));
        printer.image(&bitmap);
        printer.cut().expect("flush to vec");

        let page = printer.sink.clone();
        let header = [GS, b'v', b'0', 0x00, 2, 0, 2, 0];
        let at = page
            .windows(header.len())
            .position(|w| w == header)
            .expect("raster header present");
        // first row: leftmost pixel black
        assert_eq!(page[at + header.len()], 0x80);
        assert_eq!(page[at + header.len() + 1], 0x00);
    }

    #[test]
    fn qr_store_length_covers_payload() {
        let mut printer = printer();
        let payload = "https://example.org/?data_id=x&figure_id=1";
        printer.qrcode(payload, 6);
        printer.cut().expect("flush to vec");

        let page = printer.sink.clone();
        let store_len = (payload.len() + 3) as u8;
        let header = [GS, b'(', b'k', store_len, 0, 0x31, 0x50, 0x30];
        assert!(page.windows(header.len()).any(|w| w == header));
    }

    #[test]
    fn abandon_discards_buffered_page() {
        let mut printer = printer();
        printer.text("oops", Style::Normal);
        printer.abandon_page();
        printer.cut().expect("flush to vec");

        let needle = b"oops";
        assert!(!printer.sink.windows(needle.len()).any(|w| w == needle));
    }
}
