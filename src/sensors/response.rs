//! Sensor response curves: mapping spectral samples to film channels.

// others
use serde::{Deserialize, Serialize};
// wavert
use crate::core::quantity::{Float, Wavenumber};

/// A closed set of response variants: a scalar radiometric channel, or a
/// trichromatic response over the visible band.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Scalar,
    Rgb,
}

fn gauss(x: Float, mu: Float, sigma: Float) -> Float {
    let t = (x - mu) / sigma;
    (-0.5 as Float * t * t).exp()
}

impl Response {
    pub fn channels(&self) -> usize {
        match self {
            Response::Scalar => 1,
            Response::Rgb => 3,
        }
    }

    pub fn is_monochromatic(&self) -> bool {
        self.channels() == 1
    }

    /// Per-channel weights of a spectral sample at wavenumber `k`.
    pub fn weights(&self, k: Wavenumber) -> [Float; 3] {
        match self {
            Response::Scalar => [1.0, 0.0, 0.0],
            Response::Rgb => {
                let nm = k.wavelength().0 * 1e9;
                [
                    gauss(nm, 605.0, 45.0),
                    gauss(nm, 545.0, 45.0),
                    gauss(nm, 455.0, 45.0),
                ]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quantity::Length;

    #[test]
    fn rgb_weights_peak_in_their_bands() {
        let r = Response::Rgb;
        let red = r.weights(Wavenumber::from_wavelength(Length(605e-9)));
        assert!(red[0] > red[1] && red[0] > red[2]);
        let blue = r.weights(Wavenumber::from_wavelength(Length(455e-9)));
        assert!(blue[2] > blue[0] && blue[2] > blue[1]);
    }

    #[test]
    fn scalar_response_is_flat() {
        let r = Response::Scalar;
        assert_eq!(r.channels(), 1);
        let w = r.weights(Wavenumber::from_wavelength(Length(500e-9)));
        assert_eq!(w[0], 1.0);
    }
}
