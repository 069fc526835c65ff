//! Shading-language type representation

/// Scalar base types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// No value
    Void,
    /// 32-bit float
    Float,
    /// 32-bit signed integer
    Int,
    /// 32-bit unsigned integer
    Uint,
    /// Opaque sampler handle
    Sampler,
}

/// A scalar, vector or matrix type.
///
/// A matrix is `matrix_cols` columns of `vector_size`-component vectors, so
/// `matrix_cols > 1` implies matrix and `vector_size > 1` with a single
/// column implies vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type {
    scalar: ScalarType,
    vector_size: u8,
    matrix_cols: u8,
}

impl Type {
    /// A scalar type.
    pub const fn scalar(scalar: ScalarType) -> Self {
        Self {
            scalar,
            vector_size: 1,
            matrix_cols: 1,
        }
    }

    /// A vector of `size` scalars.
    pub const fn vector(scalar: ScalarType, size: u8) -> Self {
        Self {
            scalar,
            vector_size: size,
            matrix_cols: 1,
        }
    }

    /// A matrix of `cols` columns, each a vector of `rows` scalars.
    pub const fn matrix(scalar: ScalarType, cols: u8, rows: u8) -> Self {
        Self {
            scalar,
            vector_size: rows,
            matrix_cols: cols,
        }
    }

    /// The scalar base type.
    pub const fn scalar_type(self) -> ScalarType {
        self.scalar
    }

    /// True for plain scalars.
    pub const fn is_scalar(self) -> bool {
        self.vector_size == 1 && self.matrix_cols == 1
    }

    /// True for non-matrix vectors.
    pub const fn is_vector(self) -> bool {
        self.vector_size > 1 && self.matrix_cols == 1
    }

    /// True for matrices.
    pub const fn is_matrix(self) -> bool {
        self.matrix_cols > 1
    }

    /// Component count of a vector (or rows of a matrix column).
    pub const fn vector_size(self) -> u8 {
        self.vector_size
    }

    /// Column count of a matrix.
    pub const fn matrix_cols(self) -> u8 {
        self.matrix_cols
    }

    /// Row count of a matrix.
    pub const fn matrix_rows(self) -> u8 {
        self.vector_size
    }

    /// Number of scalar components this type contributes to a constructor.
    pub const fn component_count(self) -> u8 {
        self.vector_size
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.scalar {
            ScalarType::Void => return write!(f, "void"),
            ScalarType::Sampler => return write!(f, "sampler"),
            ScalarType::Float => "",
            ScalarType::Int => "i",
            ScalarType::Uint => "u",
        };
        if self.is_matrix() {
            write!(f, "mat{}", self.matrix_cols)
        } else if self.is_vector() {
            write!(f, "{}vec{}", prefix, self.vector_size)
        } else {
            match self.scalar {
                ScalarType::Float => write!(f, "float"),
                ScalarType::Int => write!(f, "int"),
                ScalarType::Uint => write!(f, "uint"),
                _ => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Type::scalar(ScalarType::Float).is_scalar());
        assert!(Type::vector(ScalarType::Float, 3).is_vector());
        assert!(Type::matrix(ScalarType::Float, 4, 4).is_matrix());
        assert!(!Type::matrix(ScalarType::Float, 4, 4).is_vector());
    }

    #[test]
    fn matrix_shape() {
        let mat = Type::matrix(ScalarType::Float, 4, 3);
        assert_eq!(mat.matrix_cols(), 4);
        assert_eq!(mat.matrix_rows(), 3);
    }
}
