//! Sunrise/sunset for the dusk-to-dawn danger light.
//!
//! Uses the standard sunrise equation (mean solar noon, equation of
//! center, ecliptic longitude, hour angle at -0.833° altitude). Accuracy
//! is within a couple of minutes at mid latitudes, which is well below the
//! minute resolution the light policy works at.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

const J2000: f64 = 2_451_545.0;
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const SECONDS_PER_DAY: f64 = 86_400.0;
const OBLIQUITY_DEG: f64 = 23.4397;
/// Refraction plus the solar disc radius.
const HORIZON_ALTITUDE_DEG: f64 = -0.833;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolarTimes {
    pub sunrise: NaiveTime,
    pub sunset: NaiveTime,
}

impl SolarTimes {
    /// Dark when at or after sunset, or before sunrise, at minute resolution.
    pub fn is_dark(&self, local_now: NaiveTime) -> bool {
        let now = truncate_to_minute(local_now);
        now >= self.sunset || now < self.sunrise
    }
}

impl fmt::Display for SolarTimes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sunrise {} sunset {}",
            self.sunrise.format("%H:%M"),
            self.sunset.format("%H:%M")
        )
    }
}

/// Local sunrise and sunset on `date`, or `None` during polar day/night.
pub fn compute_solar_times<Tz: TimeZone>(
    date: NaiveDate,
    latitude: f64,
    longitude: f64,
    tz: &Tz,
) -> Option<SolarTimes> {
    let midnight = date.and_hms_opt(0, 0, 0)?.and_utc();
    let julian_date = midnight.timestamp() as f64 / SECONDS_PER_DAY + UNIX_EPOCH_JD;

    let day_number = (julian_date - J2000 + 0.0008).ceil();
    let mean_solar_noon = day_number - longitude / 360.0;

    let mean_anomaly = (357.5291 + 0.985_600_28 * mean_solar_noon).rem_euclid(360.0);
    let m_rad = mean_anomaly.to_radians();
    let center = 1.9148 * m_rad.sin() + 0.0200 * (2.0 * m_rad).sin() + 0.0003 * (3.0 * m_rad).sin();
    let ecliptic_longitude = (mean_anomaly + center + 180.0 + 102.9372).rem_euclid(360.0);
    let lambda_rad = ecliptic_longitude.to_radians();

    let transit =
        J2000 + mean_solar_noon + 0.0053 * m_rad.sin() - 0.0069 * (2.0 * lambda_rad).sin();

    let sin_declination = lambda_rad.sin() * OBLIQUITY_DEG.to_radians().sin();
    let cos_declination = sin_declination.asin().cos();
    let lat_rad = latitude.to_radians();

    let cos_hour_angle = (HORIZON_ALTITUDE_DEG.to_radians().sin()
        - lat_rad.sin() * sin_declination)
        / (lat_rad.cos() * cos_declination);
    if !(-1.0..=1.0).contains(&cos_hour_angle) {
        return None;
    }
    let hour_angle_days = cos_hour_angle.acos().to_degrees() / 360.0;

    let sunrise = julian_to_local_time(transit - hour_angle_days, tz)?;
    let sunset = julian_to_local_time(transit + hour_angle_days, tz)?;
    Some(SolarTimes { sunrise, sunset })
}

fn julian_to_local_time<Tz: TimeZone>(julian: f64, tz: &Tz) -> Option<NaiveTime> {
    let unix_secs = ((julian - UNIX_EPOCH_JD) * SECONDS_PER_DAY).round() as i64;
    let utc: DateTime<Utc> = DateTime::from_timestamp(unix_secs, 0)?;
    Some(truncate_to_minute(utc.with_timezone(tz).time()))
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    time.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}
