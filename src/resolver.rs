use std::sync::Arc;

use serde::Serialize;

use crate::diagnostics::{Diagnostics, Stage};
use crate::geocoding::{GeocodeCandidate, GeocodingService, LocationType};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedLocation {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    Found(ResolvedLocation),
    NotFound,
}

/// Picks the first rooftop-precision candidate, else the first candidate.
pub fn select_candidate(candidates: &[GeocodeCandidate]) -> Option<&GeocodeCandidate> {
    candidates
        .iter()
        .find(|candidate| candidate.location_type == LocationType::Rooftop)
        .or_else(|| candidates.first())
}

pub struct CoordinateResolver {
    geocoder: Arc<dyn GeocodingService>,
    country: String,
    diagnostics: Diagnostics,
}

impl CoordinateResolver {
    pub fn new(
        geocoder: Arc<dyn GeocodingService>,
        country: impl Into<String>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            geocoder,
            country: country.into(),
            diagnostics,
        }
    }

    /// One geocoding call per invocation. Transport and API errors are
    /// reported and collapse to `NotFound`.
    pub async fn resolve(&self, address: &str) -> Resolution {
        match self.geocoder.geocode(address, &self.country).await {
            Ok(candidates) => match select_candidate(&candidates) {
                Some(candidate) => Resolution::Found(ResolvedLocation {
                    lat: candidate.lat,
                    lng: candidate.lng,
                }),
                None => {
                    self.diagnostics.warn(
                        Stage::Geocode,
                        format!("no geocoding result for '{address}'"),
                    );
                    Resolution::NotFound
                }
            },
            Err(err) => {
                self.diagnostics
                    .error(Stage::Geocode, format!("geocoding failed: {err}"));
                Resolution::NotFound
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::diagnostics::Severity;
    use crate::errors::{AppError, AppResult};

    fn candidate(kind: &str, lat: f64, lng: f64) -> GeocodeCandidate {
        GeocodeCandidate::new(LocationType::parse(kind), lat, lng)
    }

    #[test]
    fn prefers_first_rooftop_regardless_of_position() {
        let candidates = vec![
            candidate("APPROXIMATE", 1.0, 1.0),
            candidate("GEOMETRIC_CENTER", 2.0, 2.0),
            candidate("ROOFTOP", 3.0, 3.0),
            candidate("ROOFTOP", 4.0, 4.0),
        ];
        assert_eq!(select_candidate(&candidates).unwrap().lat, 3.0);
    }

    #[test]
    fn falls_back_to_first_candidate() {
        let candidates = vec![
            candidate("RANGE_INTERPOLATED", 5.0, 5.0),
            candidate("APPROXIMATE", 6.0, 6.0),
        ];
        assert_eq!(select_candidate(&candidates).unwrap().lat, 5.0);
        assert!(select_candidate(&[]).is_none());
    }

    struct FixedGeocoder {
        reply: Mutex<Option<AppResult<Vec<GeocodeCandidate>>>>,
        countries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GeocodingService for FixedGeocoder {
        async fn geocode(
            &self,
            _address: &str,
            country: &str,
        ) -> AppResult<Vec<GeocodeCandidate>> {
            self.countries.lock().push(country.to_string());
            self.reply.lock().take().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn resolver(
        reply: AppResult<Vec<GeocodeCandidate>>,
    ) -> (CoordinateResolver, Arc<FixedGeocoder>, Diagnostics) {
        let geocoder = Arc::new(FixedGeocoder {
            reply: Mutex::new(Some(reply)),
            countries: Mutex::new(Vec::new()),
        });
        let diagnostics = Diagnostics::new();
        let resolver = CoordinateResolver::new(geocoder.clone(), "JP", diagnostics.clone());
        (resolver, geocoder, diagnostics)
    }

    #[tokio::test]
    async fn resolves_with_country_filter() {
        let (resolver, geocoder, diagnostics) = resolver(Ok(vec![
            candidate("APPROXIMATE", 35.0, 139.0),
            candidate("ROOFTOP", 35.6895, 139.6917),
        ]));

        let resolution = resolver.resolve("東京都千代田区1-1").await;

        assert_eq!(
            resolution,
            Resolution::Found(ResolvedLocation {
                lat: 35.6895,
                lng: 139.6917
            })
        );
        assert_eq!(geocoder.countries.lock().clone(), vec!["JP".to_string()]);
        assert!(diagnostics.is_empty());
    }

    #[tokio::test]
    async fn empty_results_warn() {
        let (resolver, _, diagnostics) = resolver(Ok(Vec::new()));
        assert_eq!(resolver.resolve("nowhere").await, Resolution::NotFound);
        assert_eq!(diagnostics.count(Severity::Warning), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_reported() {
        let (resolver, _, diagnostics) =
            resolver(Err(AppError::RateLimited { service: "geocoding" }));
        assert_eq!(resolver.resolve("anywhere").await, Resolution::NotFound);
        assert_eq!(diagnostics.count(Severity::Error), 1);
    }
}
