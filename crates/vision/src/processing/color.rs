//! 8-bit BGR <-> L*a*b* conversion with OpenCV's channel scaling
//! (L in 0..=255, a and b offset by 128).

use std::collections::HashMap;

use palette::{FromColor, Lab, Srgb};

pub(crate) fn bgr_to_lab(bgr: &[u8]) -> Vec<u8> {
    let mut memo: HashMap<[u8; 3], [u8; 3]> = HashMap::new();
    let mut out = Vec::with_capacity(bgr.len());
    for px in bgr.chunks_exact(3) {
        let key = [px[0], px[1], px[2]];
        let lab = *memo.entry(key).or_insert_with(|| encode_lab(key));
        out.extend_from_slice(&lab);
    }
    out
}

pub(crate) fn lab_to_bgr(lab: &[u8]) -> Vec<u8> {
    let mut memo: HashMap<[u8; 3], [u8; 3]> = HashMap::new();
    let mut out = Vec::with_capacity(lab.len());
    for px in lab.chunks_exact(3) {
        let key = [px[0], px[1], px[2]];
        let bgr = *memo.entry(key).or_insert_with(|| decode_lab(key));
        out.extend_from_slice(&bgr);
    }
    out
}

fn encode_lab([b, g, r]: [u8; 3]) -> [u8; 3] {
    let srgb = Srgb::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let lab: Lab = Lab::from_color(srgb);
    [
        to_u8(lab.l * 255.0 / 100.0),
        to_u8(lab.a + 128.0),
        to_u8(lab.b + 128.0),
    ]
}

fn decode_lab([l, a, b]: [u8; 3]) -> [u8; 3] {
    let lab: Lab = Lab::new(l as f32 * 100.0 / 255.0, a as f32 - 128.0, b as f32 - 128.0);
    let srgb = Srgb::from_color(lab);
    [
        to_u8(srgb.blue * 255.0),
        to_u8(srgb.green * 255.0),
        to_u8(srgb.red * 255.0),
    ]
}

fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_has_neutral_chroma() {
        for level in [0u8, 64, 128, 200, 255] {
            let lab = bgr_to_lab(&[level, level, level]);
            assert!((lab[1] as i32 - 128).abs() <= 1, "a={} at {level}", lab[1]);
            assert!((lab[2] as i32 - 128).abs() <= 1, "b={} at {level}", lab[2]);
        }
    }

    #[test]
    fn luminance_spans_the_full_byte_range() {
        assert_eq!(bgr_to_lab(&[0, 0, 0])[0], 0);
        assert_eq!(bgr_to_lab(&[255, 255, 255])[0], 255);
    }

    #[test]
    fn gray_levels_survive_a_round_trip() {
        let gray: Vec<u8> = (0..=255u8).flat_map(|v| [v, v, v]).collect();
        let back = lab_to_bgr(&bgr_to_lab(&gray));
        for (orig, restored) in gray.iter().zip(&back) {
            assert!(
                (*orig as i32 - *restored as i32).abs() <= 2,
                "{orig} came back as {restored}"
            );
        }
    }

    #[test]
    fn channel_order_is_blue_green_red() {
        let red_lab = bgr_to_lab(&[0, 0, 255]);
        assert!(red_lab[1] > 128, "red should have positive a*");
        let restored = lab_to_bgr(&red_lab);
        assert!(restored[2] > 240 && restored[0] < 20, "{restored:?}");
    }
}
