use image::{GrayImage, Luma};

use crate::{
    catalog::QUESTION_COUNT,
    error::{Error, Result},
};

/// Height share per stack level, top of the page down to the base.
pub const LEVEL_RATIOS: [f32; QUESTION_COUNT] = [1.5, 3.0, 1.0, 6.0, 6.0, 1.5];

pub const PADDING: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outline {
    Rect,
    Ellipse,
    /// Apex at the top, full width at the bottom.
    Triangle,
    /// Full width at the bottom, `top` fraction of it at the top.
    Trapezoid { top: f32 },
    /// Full width at the top, `bottom` fraction of it at the bottom.
    Funnel { bottom: f32 },
    Diamond,
    /// Half-ellipse cap over straight sides.
    Arch,
    /// Pinched waist.
    Hourglass,
}

impl Outline {
    /// Half-width as a fraction of the level's half-width, at vertical
    /// position `t` in [0, 1] measured from the top edge.
    fn half_width_frac(self, t: f32) -> f32 {
        match self {
            Outline::Rect => 1.0,
            Outline::Ellipse => {
                let c = 2.0 * t - 1.0;
                (1.0 - c * c).max(0.0).sqrt()
            }
            Outline::Triangle => t,
            Outline::Trapezoid { top } => top + (1.0 - top) * t,
            Outline::Funnel { bottom } => 1.0 - (1.0 - bottom) * t,
            Outline::Diamond => 1.0 - (2.0 * t - 1.0).abs(),
            Outline::Arch => {
                if t < 0.5 {
                    let c = 1.0 - 2.0 * t;
                    (1.0 - c * c).max(0.0).sqrt()
                } else {
                    1.0
                }
            }
            Outline::Hourglass => 0.35 + 0.65 * (2.0 * t - 1.0).abs(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Shape {
    pub name: &'static str,
    /// Width over height.
    pub ratio: f32,
    outline: Outline,
}

impl Shape {
    const fn new(name: &'static str, ratio: f32, outline: Outline) -> Self {
        Self {
            name,
            ratio,
            outline,
        }
    }
}

pub const LIBRARY: &[Shape] = &[
    // bases
    Shape::new("plinth", 3.0, Outline::Trapezoid { top: 0.8 }),
    Shape::new("wave", 3.5, Outline::Ellipse),
    Shape::new("rocker", 3.0, Outline::Arch),
    Shape::new("platform", 4.0, Outline::Rect),
    Shape::new("stairs", 3.2, Outline::Trapezoid { top: 0.4 }),
    Shape::new("cloud", 2.8, Outline::Ellipse),
    // legs
    Shape::new("pillars", 0.45, Outline::Hourglass),
    Shape::new("skirt", 0.9, Outline::Triangle),
    Shape::new("tripod", 1.1, Outline::Triangle),
    Shape::new("wheels", 0.8, Outline::Ellipse),
    Shape::new("root", 0.7, Outline::Trapezoid { top: 0.5 }),
    // torsos
    Shape::new("barrel", 0.55, Outline::Ellipse),
    Shape::new("hourglass", 0.6, Outline::Hourglass),
    Shape::new("shield", 0.65, Outline::Funnel { bottom: 0.35 }),
    Shape::new("column", 0.35, Outline::Rect),
    Shape::new("slab", 0.8, Outline::Rect),
    // neck
    Shape::new("collar", 2.0, Outline::Rect),
    // heads
    Shape::new("dome", 1.2, Outline::Arch),
    Shape::new("orb", 1.0, Outline::Ellipse),
    Shape::new("lantern", 0.9, Outline::Trapezoid { top: 0.6 }),
    Shape::new("prism", 1.1, Outline::Triangle),
    Shape::new("capsule", 0.7, Outline::Ellipse),
    Shape::new("bell", 0.9, Outline::Arch),
    // headgear
    Shape::new("halo", 2.5, Outline::Ellipse),
    Shape::new("crown", 1.8, Outline::Funnel { bottom: 0.55 }),
    Shape::new("antenna", 0.25, Outline::Rect),
    Shape::new("plume", 0.8, Outline::Triangle),
    Shape::new("beacon", 1.0, Outline::Diamond),
];

pub fn by_name(name: &str) -> Option<&'static Shape> {
    LIBRARY.iter().find(|shape| shape.name == name)
}

pub fn resolve(names: [&str; QUESTION_COUNT]) -> Result<[&'static Shape; QUESTION_COUNT]> {
    let mut shapes = [&LIBRARY[0]; QUESTION_COUNT];
    for (slot, name) in shapes.iter_mut().zip(names) {
        *slot = by_name(name)
            .ok_or_else(|| Error::config(format!("unknown shape '{name}' in shape table")))?;
    }
    Ok(shapes)
}

#[derive(Debug)]
pub struct Level {
    pub shape: &'static Shape,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug)]
pub struct Figure {
    pub width: f32,
    pub height: f32,
    pub levels: Vec<Level>,
}

/// Stacks six shapes top to bottom. Identical inputs always produce the
/// same layout, the same SVG bytes and the same raster bytes.
pub fn compose(shapes: [&'static Shape; QUESTION_COUNT], total_height: f32) -> Figure {
    let ratio_sum: f32 = LEVEL_RATIOS.iter().sum();
    let unit = total_height / ratio_sum;

    let heights: Vec<f32> = LEVEL_RATIOS.iter().map(|ratio| ratio * unit).collect();
    let widths: Vec<f32> = shapes
        .iter()
        .zip(&heights)
        .map(|(shape, height)| shape.ratio * height)
        .collect();

    let max_width = widths.iter().fold(0.0f32, |acc, w| acc.max(*w));
    let canvas_width = max_width + 2.0 * PADDING;
    let canvas_height = total_height + 2.0 * PADDING;

    let mut levels = Vec::with_capacity(QUESTION_COUNT);
    let mut y = PADDING;
    for ((shape, height), width) in shapes.into_iter().zip(heights).zip(widths) {
        levels.push(Level {
            shape,
            x: (canvas_width - width) / 2.0,
            y,
            width,
            height,
        });
        y += height;
    }

    Figure {
        width: canvas_width,
        height: canvas_height,
        levels,
    }
}

impl Figure {
    /// Canonical vector form; the gallery stores this next to the record.
    pub fn to_svg(&self) -> String {
        let mut svg = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{}\" height=\"{}\" viewBox=\"0 0 {} {}\">\n",
            num(self.width),
            num(self.height),
            num(self.width),
            num(self.height),
        );
        for level in &self.levels {
            svg.push_str(&level.to_svg_element());
            svg.push('\n');
        }
        svg.push_str("</svg>\n");
        svg
    }

    /// Monochrome raster of the same layout, `dots` pixels wide. Shape order
    /// and height shares are exactly those of the vector form.
    pub fn rasterize(&self, dots: u32) -> GrayImage {
        let scale = dots as f32 / self.width;
        let rows = ((self.height * scale).round() as u32).max(1);
        let mut image = GrayImage::from_pixel(dots, rows, Luma([0xFF]));
        let center = self.width / 2.0 * scale;

        for py in 0..rows {
            let y_mid = (py as f32 + 0.5) / scale;
            let Some(level) = self
                .levels
                .iter()
                .find(|level| y_mid >= level.y && y_mid < level.y + level.height)
            else {
                continue;
            };

            let t = (y_mid - level.y) / level.height;
            let half = level.shape.outline.half_width_frac(t) * level.width / 2.0 * scale;
            if half <= 0.0 {
                continue;
            }

            let from = ((center - half).floor().max(0.0)) as u32;
            let to = (((center + half).ceil()) as u32).min(dots);
            for px in from..to {
                image.put_pixel(px, py, Luma([0x00]));
            }
        }

        image
    }
}

impl Level {
    fn to_svg_element(&self) -> String {
        let (x, y, w, h) = (self.x, self.y, self.width, self.height);
        let (left, right, top, bottom) = (x, x + w, y, y + h);
        let cx = x + w / 2.0;
        let cy = y + h / 2.0;

        match self.shape.outline {
            Outline::Rect => format!(
                "<rect x=\"{}\" y=\"{}\" width=\"{}\" height=\"{}\"/>",
                num(x),
                num(y),
                num(w),
                num(h)
            ),
            Outline::Ellipse => format!(
                "<ellipse cx=\"{}\" cy=\"{}\" rx=\"{}\" ry=\"{}\"/>",
                num(cx),
                num(cy),
                num(w / 2.0),
                num(h / 2.0)
            ),
            Outline::Triangle => polygon(&[(cx, top), (right, bottom), (left, bottom)]),
            Outline::Trapezoid { top: frac } => {
                let half = w * frac / 2.0;
                polygon(&[
                    (cx - half, top),
                    (cx + half, top),
                    (right, bottom),
                    (left, bottom),
                ])
            }
            Outline::Funnel { bottom: frac } => {
                let half = w * frac / 2.0;
                polygon(&[
                    (left, top),
                    (right, top),
                    (cx + half, bottom),
                    (cx - half, bottom),
                ])
            }
            Outline::Diamond => polygon(&[(cx, top), (right, cy), (cx, bottom), (left, cy)]),
            Outline::Arch => format!(
                "<path d=\"M {} {} L {} {} A {} {} 0 0 1 {} {} L {} {} Z\"/>",
                num(left),
                num(bottom),
                num(left),
                num(cy),
                num(w / 2.0),
                num(h / 2.0),
                num(right),
                num(cy),
                num(right),
                num(bottom)
            ),
            Outline::Hourglass => {
                let waist = w * 0.35 / 2.0;
                polygon(&[
                    (left, top),
                    (right, top),
                    (cx + waist, cy),
                    (right, bottom),
                    (left, bottom),
                    (cx - waist, cy),
                ])
            }
        }
    }
}

fn polygon(points: &[(f32, f32)]) -> String {
    let coords: Vec<String> = points
        .iter()
        .map(|(x, y)| format!("{},{}", num(*x), num(*y)))
        .collect();
    format!("<polygon points=\"{}\"/>", coords.join(" "))
}

fn num(value: f32) -> String {
    format!("{value:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::figurine::{FIGURINE_COUNT, SHAPES, shapes_of};

    fn stack_for(id: u32) -> [&'static Shape; QUESTION_COUNT] {
        resolve(shapes_of(id)).expect("table names resolve")
    }

    #[test]
    fn every_table_name_is_in_the_library() {
        for row in SHAPES {
            for name in row {
                assert!(by_name(name).is_some(), "missing shape '{name}'");
            }
        }
    }

    #[test]
    fn heights_follow_the_level_ratios() {
        let figure = compose(stack_for(1), 190.0);

        let total: f32 = figure.levels.iter().map(|level| level.height).sum();
        assert!((total - 190.0).abs() < 0.001);

        let unit = figure.levels[2].height; // ratio 1.0 level
        for (level, ratio) in figure.levels.iter().zip(LEVEL_RATIOS) {
            assert!((level.height - unit * ratio).abs() < 0.001);
        }
    }

    #[test]
    fn levels_are_horizontally_centered() {
        let figure = compose(stack_for(1371), 190.0);
        for level in &figure.levels {
            let center = level.x + level.width / 2.0;
            assert!((center - figure.width / 2.0).abs() < 0.001);
        }
    }

    #[test]
    fn level_widths_follow_shape_ratios() {
        let figure = compose(stack_for(1), 190.0);
        for level in &figure.levels {
            assert!((level.width - level.height * level.shape.ratio).abs() < 0.001);
        }
    }

    #[test]
    fn canvas_wraps_the_widest_level_plus_padding() {
        let figure = compose(stack_for(27_000), 190.0);
        let widest = figure
            .levels
            .iter()
            .fold(0.0f32, |acc, level| acc.max(level.width));
        assert!((figure.width - (widest + 2.0 * PADDING)).abs() < 0.001);
        assert!((figure.height - (190.0 + 2.0 * PADDING)).abs() < 0.001);
    }

    #[test]
    fn svg_is_byte_identical_across_runs() {
        let first = compose(stack_for(1371), 190.0).to_svg();
        let second = compose(stack_for(1371), 190.0).to_svg();
        assert_eq!(first, second);
        assert!(first.starts_with("<svg "));
        assert_eq!(first.matches('\n').count(), QUESTION_COUNT + 2);
    }

    #[test]
    fn raster_is_byte_identical_across_runs() {
        let first = compose(stack_for(42), 190.0).rasterize(512);
        let second = compose(stack_for(42), 190.0).rasterize(512);
        assert_eq!(first.as_raw(), second.as_raw());
        assert_eq!(first.width(), 512);
    }

    #[test]
    fn raster_paints_the_stack_center() {
        let figure = compose(stack_for(1), 190.0);
        let image = figure.rasterize(512);

        // middle of the torso level
        let torso = &figure.levels[3];
        let scale = 512.0 / figure.width;
        let y = ((torso.y + torso.height / 2.0) * scale) as u32;
        assert_eq!(image.get_pixel(256, y).0[0], 0x00);

        // padding stays white
        assert_eq!(image.get_pixel(0, 0).0[0], 0xFF);
    }

    #[test]
    fn outline_extents_behave() {
        assert_eq!(Outline::Rect.half_width_frac(0.3), 1.0);
        assert_eq!(Outline::Triangle.half_width_frac(0.0), 0.0);
        assert_eq!(Outline::Triangle.half_width_frac(1.0), 1.0);
        assert_eq!(Outline::Diamond.half_width_frac(0.5), 1.0);
        assert!(Outline::Ellipse.half_width_frac(0.5) > 0.999);
        assert!(Outline::Hourglass.half_width_frac(0.5) < 0.4);
    }

    #[test]
    fn distinct_ids_can_share_a_canvas_height() {
        for id in [1u32, 2, 1371, FIGURINE_COUNT] {
            let figure = compose(stack_for(id), 190.0);
            assert_eq!(figure.levels.len(), QUESTION_COUNT);
        }
    }
}
