//! Display helpers for position readouts

/// Formats a decimal coordinate as hemisphere, degrees and decimal minutes,
/// e.g. `N37°08.557'` or `E10°34.691'`.
pub fn format_coordinate(coordinate: f64, is_latitude: bool) -> String {
    let hemisphere = match (is_latitude, coordinate >= 0.0) {
        (true, true) => 'N',
        (true, false) => 'S',
        (false, true) => 'E',
        (false, false) => 'W',
    };

    // Work in thousandths of a minute so rounding carries into minutes and degrees
    let total = (coordinate.abs() * 60_000.0).round() as u64;
    let degrees = total / 60_000;
    let minutes = (total % 60_000) / 1000;
    let thousandths = total % 1000;

    format!("{hemisphere}{degrees}°{minutes:02}.{thousandths:03}'")
}

pub fn kmh_to_mph(kmh: f64) -> f64 {
    kmh * 0.621371
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hemispheres() {
        assert_eq!(format_coordinate(37.142617, true), "N37°08.557'");
        assert_eq!(format_coordinate(-33.5, true), "S33°30.000'");
        assert_eq!(format_coordinate(10.578183, false), "E10°34.691'");
        assert_eq!(format_coordinate(-0.25, false), "W0°15.000'");
    }

    #[test]
    fn rounding_carries_into_degrees() {
        assert_eq!(format_coordinate(42.9999999, true), "N43°00.000'");
    }

    #[test]
    fn converts_speed() {
        assert!((kmh_to_mph(100.0) - 62.1371).abs() < 1e-9);
    }
}
