use crate::catalog::{ANSWER_COUNTS, QUESTION_COUNT};

/// Mixed-radix place values, F01..F06.
pub const RADICES: [usize; QUESTION_COUNT] = ANSWER_COUNTS;

pub const FIGURINE_COUNT: u32 = 27_000;

/// Maps six answer indices (F01..F06 order) to a figurine id in
/// `[1, 27000]`. The mapping is a plain mixed-radix number plus one.
pub fn encode(indices: [usize; QUESTION_COUNT]) -> u32 {
    let mut acc = 0usize;
    for (index, radix) in indices.into_iter().zip(RADICES) {
        debug_assert!(index < radix, "answer index {index} out of range");
        acc = acc * radix + index;
    }
    (acc + 1) as u32
}

/// Total inverse of [`encode`] on `[1, 27000]`.
pub fn decode(id: u32) -> [usize; QUESTION_COUNT] {
    debug_assert!((1..=FIGURINE_COUNT).contains(&id), "figurine id {id} out of range");
    let mut rem = (id - 1) as usize;
    let mut indices = [0usize; QUESTION_COUNT];
    for i in (0..QUESTION_COUNT).rev() {
        indices[i] = rem % RADICES[i];
        rem /= RADICES[i];
    }
    indices
}

/// Shape name per question and answer, F01..F06. F04 is deliberately
/// uniform; it still contributes a full digit to the figurine id.
pub const SHAPES: [&[&str]; QUESTION_COUNT] = [
    &["plinth", "wave", "rocker", "platform", "stairs", "cloud"],
    &["pillars", "skirt", "tripod", "wheels", "root"],
    &["barrel", "hourglass", "shield", "column", "slab"],
    &["collar", "collar", "collar", "collar", "collar", "collar"],
    &["dome", "orb", "lantern", "prism", "capsule", "bell"],
    &["halo", "crown", "antenna", "plume", "beacon"],
];

/// Shape names for a figurine id in visual order: top of the page (F06)
/// down to the base (F01).
pub fn shapes_of(id: u32) -> [&'static str; QUESTION_COUNT] {
    let indices = decode(id);
    std::array::from_fn(|level| {
        let question = QUESTION_COUNT - 1 - level;
        SHAPES[question][indices[question]]
    })
}
