//! 4x4 column-major matrices.

/// A 4x4 matrix stored column-major, as GPU uniforms expect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat4(pub [f32; 16]);

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0, //
    ]);

    pub const fn identity() -> Self {
        Self::IDENTITY
    }

    /// A pure scale matrix.
    pub fn from_scale(x: f32, y: f32, z: f32) -> Self {
        Self::IDENTITY.scaled(x, y, z)
    }

    /// Texture-space flip: `t' = 1 - t`.
    ///
    /// Producer surfaces hand out images with the origin at the top left,
    /// which this maps to texture coordinates.
    pub fn flip_vertical() -> Self {
        let mut m = Self::IDENTITY;
        m.0[5] = -1.0;
        m.0[13] = 1.0;
        m
    }

    /// Post-multiply by a scale, scaling the first three columns.
    pub fn scaled(mut self, x: f32, y: f32, z: f32) -> Self {
        for (column, factor) in [x, y, z].into_iter().enumerate() {
            for row in 0..4 {
                self.0[column * 4 + row] *= factor;
            }
        }
        self
    }

    /// `self * rhs`.
    pub fn multiply(&self, rhs: &Mat4) -> Mat4 {
        let mut out = [0.0f32; 16];
        for column in 0..4 {
            for row in 0..4 {
                out[column * 4 + row] = (0..4)
                    .map(|k| self.get(row, k) * rhs.get(k, column))
                    .sum();
            }
        }
        Mat4(out)
    }

    pub fn get(&self, row: usize, column: usize) -> f32 {
        self.0[column * 4 + row]
    }

    /// Apply to the point `(x, y, 0, 1)`.
    pub fn transform_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.get(0, 0) * x + self.get(0, 1) * y + self.get(0, 3),
            self.get(1, 0) * x + self.get(1, 1) * y + self.get(1, 3),
        )
    }

    pub fn as_array(&self) -> &[f32; 16] {
        &self.0
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}
