//! Commanding the detector.

use beamline_core::{PropertyHost, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// The detector operations the coordinator needs.
pub trait DetectorControl: Send + Sync {
    /// Begin a continuous series of up to `nimages` images.
    fn start_series(&self, nimages: u64) -> Result<()>;

    /// Stop the series and record a fresh background (dark) image.
    fn read_background(&self) -> Result<()>;

    /// True while the detector is still producing images.
    fn is_acquiring(&self) -> bool;
}

/// A detector driven through the properties of its driver object.
///
/// Uses the driver's `nimages`, `acquire`, `read_bkg` and `acquiring`
/// properties.
pub struct ExternalDetector {
    driver: Arc<dyn PropertyHost>,
}

impl fmt::Debug for ExternalDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalDetector")
            .field("driver", self.driver.object_id())
            .finish()
    }
}

impl ExternalDetector {
    /// Wrap a detector driver.
    pub fn new(driver: Arc<dyn PropertyHost>) -> Self {
        Self { driver }
    }
}

impl DetectorControl for ExternalDetector {
    fn start_series(&self, nimages: u64) -> Result<()> {
        let nimages = i64::try_from(nimages).unwrap_or(i64::MAX);
        self.driver.set_property("nimages", &Value::Int(nimages))?;
        self.driver.set_property("acquire", &Value::Bool(true))?;
        Ok(())
    }

    fn read_background(&self) -> Result<()> {
        self.driver.set_property("read_bkg", &Value::Bool(true))?;
        Ok(())
    }

    fn is_acquiring(&self) -> bool {
        match self.driver.get_property("acquiring") {
            Ok(value) => value.as_bool().unwrap_or(false),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read detector state");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use beamline_core::{Observable, PropertySet};

    #[test]
    fn test_commands_go_through_properties() {
        let driver = Arc::new(PropertySet::new("rayonix"));
        let nimages = Observable::new(driver.owner(), "nimages", 0i64);
        let acquire = Observable::new(driver.owner(), "acquire", false);
        let read_bkg = Observable::new(driver.owner(), "read_bkg", false);
        let acquiring = Observable::new(driver.owner(), "acquiring", false);
        driver.register(Arc::new(nimages.clone()));
        driver.register(Arc::new(acquire.clone()));
        driver.register(Arc::new(read_bkg.clone()));
        driver.register(Arc::new(acquiring.clone()));

        let detector = ExternalDetector::new(driver);
        detector.start_series(999_999).unwrap();
        assert_eq!(nimages.get(), 999_999);
        assert!(acquire.get());

        assert!(!detector.is_acquiring());
        acquiring.update(true);
        assert!(detector.is_acquiring());

        detector.read_background().unwrap();
        assert!(read_bkg.get());
    }

    #[test]
    fn test_missing_property_is_an_error() {
        let detector = ExternalDetector::new(Arc::new(PropertySet::new("empty")));
        assert!(detector.start_series(10).is_err());
        assert!(!detector.is_acquiring());
    }
}
