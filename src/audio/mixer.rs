// src/audio/mixer.rs
// Saturating sample mixing. Every combination of two layers goes through here.

/// Add two samples, clamping to the i16 range instead of wrapping.
#[inline]
pub fn add(a: i16, b: i16) -> i16 {
    let sum = a as i32 + b as i32;
    if sum > i16::MAX as i32 {
        i16::MAX
    } else if sum < i16::MIN as i32 {
        i16::MIN
    } else {
        sum as i16
    }
}

/// Host samples are f32 in [-1.0, 1.0]; the engine works in i16.
#[inline]
pub fn f32_to_sample(value: f32) -> i16 {
    (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[inline]
pub fn sample_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}
