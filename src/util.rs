const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// Converting float to int has undefined behaviour for huge floats: https://stackoverflow.com/a/41139453.
/// To avoid this, refuse to convert floats with magnitude greater than 2**53 - 1, after which 64-bit floats no longer
/// retain integer precision.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.abs() <= FLOAT_TO_INT_MAX {
        Some(f as i64)
    } else {
        None
    }
}

/// Renders a number the way it was most likely written: integral values lose their fractional
/// part, so `5.0` becomes `"5"`.
#[allow(clippy::float_cmp)]
pub(crate) fn number_to_string(f: f64) -> String {
    match f64_to_i64_safe(f) {
        Some(i) if i as f64 == f => i.to_string(),
        _ => f.to_string(),
    }
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_percentage() -> u8 {
    100
}
