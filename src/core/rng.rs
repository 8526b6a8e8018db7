//! PCG32 pseudo-random number generation.

// others
use hexf::hexf32;
// wavert
use crate::core::quantity::Float;

pub const ONE_MINUS_EPSILON: Float = hexf32!("0x1.fffffep-1");

const PCG32_DEFAULT_STATE: u64 = 0x853c_49e6_748f_ea9b;
const PCG32_DEFAULT_STREAM: u64 = 0xda3e_39cb_94b9_5bdb;
const PCG32_MULT: u64 = 0x5851_f42d_4c95_7f2d;

#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
    inc: u64,
}

impl Default for Rng {
    fn default() -> Self {
        Rng {
            state: PCG32_DEFAULT_STATE,
            inc: PCG32_DEFAULT_STREAM,
        }
    }
}

impl Rng {
    pub fn new(init_state: u64, init_seq: u64) -> Self {
        let mut rng = Rng { state: 0, inc: (init_seq << 1) | 1 };
        rng.uniform_uint32();
        rng.state = rng.state.wrapping_add(init_state);
        rng.uniform_uint32();
        rng
    }

    pub fn uniform_uint32(&mut self) -> u32 {
        let old_state: u64 = self.state;
        self.state = old_state.wrapping_mul(PCG32_MULT).wrapping_add(self.inc);
        let xor_shifted: u32 = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot: u32 = (old_state >> 59) as u32;
        (xor_shifted >> rot) | (xor_shifted << ((!rot).wrapping_add(1) & 31))
    }

    pub fn uniform_uint32_bounded(&mut self, b: u32) -> u32 {
        let threshold = (!b).wrapping_add(1) % b;
        loop {
            let r = self.uniform_uint32();
            if r >= threshold {
                return r % b;
            }
        }
    }

    pub fn uniform_uint64(&mut self) -> u64 {
        ((self.uniform_uint32() as u64) << 32) | self.uniform_uint32() as u64
    }

    pub fn uniform_float(&mut self) -> Float {
        let f = self.uniform_uint32() as Float * 2.328_306_4e-10;
        f.min(ONE_MINUS_EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_in_unit_interval() {
        let mut rng = Rng::new(7, 13);
        for _ in 0..10_000 {
            let f = rng.uniform_float();
            assert!(f >= 0.0 && f < 1.0);
        }
    }

    #[test]
    fn bounded_draws_stay_in_bound() {
        let mut rng = Rng::default();
        for _ in 0..1_000 {
            assert!(rng.uniform_uint32_bounded(17) < 17);
        }
    }

    #[test]
    fn streams_differ() {
        let mut a = Rng::new(1, 1);
        let mut b = Rng::new(1, 2);
        let same = (0..16).all(|_| a.uniform_uint32() == b.uniform_uint32());
        assert!(!same);
    }
}
