//! Grid carbon intensity at job submission time.
//!
//! Without a region every job gets the UK yearly average. With a region, the regional forecast of
//! the half hour starting at submission is fetched from the National Grid carbon intensity API.
//! A failed lookup only affects the job it was made for.

use std::{fmt, str::FromStr, time::Duration as StdDuration};

use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, TimeZone as _, Utc};
use color_eyre::{
    eyre::{eyre, WrapErr as _},
    Result,
};
use itertools::Itertools as _;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    config::ConfigError,
    diagnostics::{Diagnostic, Diagnostics},
    job::JobRecord,
};

/// gCO2e/kWh, UK 2024 average
pub const UK_AVERAGE_INTENSITY: f64 = 124.0;
pub const DEFAULT_TIMEOUT: StdDuration = StdDuration::from_secs(10);
pub const API_BASE_URL: &str = "https://api.carbonintensity.org.uk/regional/intensity";

const API_TIME_FORMAT: &str = "%Y-%m-%dT%H:%MZ";
const LOOKUP_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    NorthScotland,
    SouthScotland,
    NorthWestEngland,
    NorthEastEngland,
    Yorkshire,
    NorthWales,
    SouthWales,
    WestMidlands,
    EastMidlands,
    EastEngland,
    SouthWestEngland,
    SouthEngland,
    London,
    SouthEastEngland,
}

impl Region {
    pub const ALL: [Region; 14] = [
        Region::NorthScotland,
        Region::SouthScotland,
        Region::NorthWestEngland,
        Region::NorthEastEngland,
        Region::Yorkshire,
        Region::NorthWales,
        Region::SouthWales,
        Region::WestMidlands,
        Region::EastMidlands,
        Region::EastEngland,
        Region::SouthWestEngland,
        Region::SouthEngland,
        Region::London,
        Region::SouthEastEngland,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Region::NorthScotland => "North Scotland",
            Region::SouthScotland => "South Scotland",
            Region::NorthWestEngland => "North West England",
            Region::NorthEastEngland => "North East England",
            Region::Yorkshire => "Yorkshire",
            Region::NorthWales => "North Wales",
            Region::SouthWales => "South Wales",
            Region::WestMidlands => "West Midlands",
            Region::EastMidlands => "East Midlands",
            Region::EastEngland => "East England",
            Region::SouthWestEngland => "South West England",
            Region::SouthEngland => "South England",
            Region::London => "London",
            Region::SouthEastEngland => "South East England",
        }
    }

    /// `regionid` as used by the API, 1 to 14 in the order of [`Region::ALL`]
    pub fn api_id(self) -> u8 {
        self as u8 + 1
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where intensities come from for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegionSelector {
    #[default]
    UkAverage,
    Region(Region),
}

impl FromStr for RegionSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "UK_average" {
            return Ok(Self::UkAverage);
        }
        Region::ALL
            .into_iter()
            .find(|region| region.name() == s)
            .map(Self::Region)
            .ok_or_else(|| ConfigError::UnknownRegion(s.to_owned()))
    }
}

impl fmt::Display for RegionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionSelector::UkAverage => f.write_str("UK_average"),
            RegionSelector::Region(region) => region.fmt(f),
        }
    }
}

/// A time indexed regional intensity oracle.
pub trait CarbonIntensitySource {
    /// Forecast intensity in gCO2e/kWh for the window `from..to`
    fn forecast(&self, region: Region, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<f64>;
}

#[derive(Debug, Deserialize)]
struct IntensityResponse {
    data: RegionData,
}

#[derive(Debug, Deserialize)]
struct RegionData {
    data: Vec<Period>,
}

#[derive(Debug, Deserialize)]
struct Period {
    intensity: Intensity,
}

#[derive(Debug, Deserialize)]
struct Intensity {
    forecast: f64,
}

/// Client for `api.carbonintensity.org.uk`
#[derive(Debug, Clone)]
pub struct CarbonIntensityApi {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl CarbonIntensityApi {
    pub fn new(timeout: StdDuration) -> Result<Self> {
        Self::with_base_url(API_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: StdDuration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("building http client")?;
        Ok(Self { client, base_url: base_url.into() })
    }

    pub fn url(&self, region: Region, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}/regionid/{}",
            self.base_url.trim_end_matches('/'),
            from.format(API_TIME_FORMAT),
            to.format(API_TIME_FORMAT),
            region.api_id()
        )
    }
}

impl CarbonIntensitySource for CarbonIntensityApi {
    #[instrument(skip(self))]
    fn forecast(&self, region: Region, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<f64> {
        let url = self.url(region, from, to);
        let response: IntensityResponse = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .and_then(|response| response.error_for_status())
            .wrap_err_with(|| format!("requesting {url}"))?
            .json()
            .wrap_err("decoding carbon intensity response")?;

        let period = response.data.data.first().ok_or_else(|| eyre!("response holds no forecast period"))?;
        debug!(forecast = period.intensity.forecast);
        Ok(period.intensity.forecast)
    }
}

/// The lookup window for a naive, cluster local submission time
pub fn lookup_window(submission_time: NaiveDateTime) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let from = Local
        .from_local_datetime(&submission_time)
        .single()
        .ok_or_else(|| eyre!("{submission_time} is not a unique local time"))?
        .with_timezone(&Utc);
    Ok((from, from + TimeDelta::minutes(LOOKUP_WINDOW_MINUTES)))
}

/// One intensity per job, in job order. Never fails: a job whose lookup goes wrong gets
/// [`UK_AVERAGE_INTENSITY`] and a [`Diagnostic::CarbonIntensityFallback`].
#[instrument(skip_all, fields(jobs = jobs.len(), %selector))]
pub fn intensities(
    jobs: &[JobRecord],
    selector: RegionSelector,
    source: &dyn CarbonIntensitySource,
    diagnostics: &mut Diagnostics,
) -> Vec<f64> {
    let RegionSelector::Region(region) = selector else {
        return vec![UK_AVERAGE_INTENSITY; jobs.len()];
    };

    jobs.iter()
        .map(|job| {
            lookup_window(job.submission_time)
                .and_then(|(from, to)| source.forecast(region, from, to))
                .and_then(|intensity| {
                    if intensity.is_finite() && intensity >= 0.0 {
                        Ok(intensity)
                    } else {
                        Err(eyre!("forecast {intensity} is not a valid intensity"))
                    }
                })
                .unwrap_or_else(|e| {
                    diagnostics.push(Diagnostic::CarbonIntensityFallback {
                        job_id: job.job_id.to_string(),
                        reason: format!("{e:#}"),
                    });
                    UK_AVERAGE_INTENSITY
                })
        })
        .collect_vec()
}
