//! left/right balance

use std::fmt;

/// Balance law: the side being panned away from is cut linearly, the other
/// side stays at unity.  Center leaves both channels untouched.
pub struct Fader {
    left: f32,
    right: f32,
    val: f32,
}

impl Default for Fader {
    fn default() -> Self {
        Self::new()
    }
}

impl Fader {
    pub fn new() -> Fader {
        let mut f = Fader {
            left: 1.0,
            right: 1.0,
            val: 0.0,
        };
        f.set(0.0);
        f
    }
    /// call this with a value from -1.0 (hard pan left) to +1.0 (hard pan right)
    pub fn set(&mut self, v: f32) {
        self.val = f32::clamp(v, -1.0, 1.0);
        self.left = if self.val > 0.0 { 1.0 - self.val } else { 1.0 };
        self.right = if self.val < 0.0 { 1.0 + self.val } else { 1.0 };
    }

    pub fn get(&self) -> f32 {
        self.val
    }

    pub fn left(&self) -> f32 {
        self.left
    }

    pub fn right(&self) -> f32 {
        self.right
    }
}

impl fmt::Display for Fader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ left: {}, right: {} ]", self.left, self.right)
    }
}
