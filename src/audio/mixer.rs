//! Sample mixing for overlapping audio tracks.
//! Sums are clamped to the i16 range rather than wrapping.

/// Adds `src` into `dst` sample by sample, saturating at the i16 limits.
pub fn mix_into(dst: &mut [i16], src: &[i16]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = d.saturating_add(*s);
    }
}

/// Adds `src` scaled by `volume` into `dst`, saturating at the i16 limits.
pub fn mix_scaled_into(dst: &mut [i16], src: &[i16], volume: f32) {
    if (volume - 1.0).abs() < f32::EPSILON {
        mix_into(dst, src);
        return;
    }
    if volume <= 0.0 {
        return;
    }
    for (d, s) in dst.iter_mut().zip(src) {
        let scaled = (*s as f32 * volume).round().clamp(i16::MIN as f32, i16::MAX as f32);
        let sum = *d as i32 + scaled as i32;
        *d = sum.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_saturates_high() {
        let mut dst = vec![i16::MAX; 4];
        mix_into(&mut dst, &[i16::MAX; 4]);
        assert_eq!(dst, vec![i16::MAX; 4]);
    }

    #[test]
    fn test_mix_saturates_low() {
        let mut dst = vec![i16::MIN, -20_000];
        mix_into(&mut dst, &[i16::MIN, -20_000]);
        assert_eq!(dst, vec![i16::MIN, i16::MIN]);
    }

    #[test]
    fn test_mix_full_scale_streams_stay_in_range() {
        let a: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN }).collect();
        let mut dst = a.clone();
        mix_into(&mut dst, &a);
        assert_eq!(dst, a);
    }

    #[test]
    fn test_mix_plain_sum() {
        let mut dst = vec![100, -100];
        mix_into(&mut dst, &[23, 50]);
        assert_eq!(dst, vec![123, -50]);
    }

    #[test]
    fn test_mix_scaled() {
        let mut dst = vec![0, 10];
        mix_scaled_into(&mut dst, &[1000, -1000], 0.5);
        assert_eq!(dst, vec![500, -490]);

        let mut muted = vec![3, 3];
        mix_scaled_into(&mut muted, &[1000, 1000], 0.0);
        assert_eq!(muted, vec![3, 3]);

        let mut loud = vec![30_000];
        mix_scaled_into(&mut loud, &[30_000], 2.0);
        assert_eq!(loud, vec![i16::MAX]);
    }
}
