//! Base data types of the shading language and their host-visible layouts.

use strum::{AsRefStr, Display};

/// Base types that may appear in shader interfaces, declarations and
/// closure schemas.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    Void,
    Int,
    Float,
    Bool,
    Float3,
    Float4,
    Matrix,
    Double,
    Closure,
}

impl DataType {
    /// Size in bytes of a value of this type, as seen by the host.
    pub fn size(self) -> u32 {
        match self {
            DataType::Void => 0,
            DataType::Int | DataType::Float => 4,
            DataType::Bool => 1,
            DataType::Float3 => 12,
            DataType::Float4 => 16,
            DataType::Matrix => 64,
            DataType::Double => 8,
            DataType::Closure => 8,
        }
    }

    pub fn align(self) -> u32 {
        match self {
            DataType::Void | DataType::Bool => 1,
            DataType::Int | DataType::Float | DataType::Float3 | DataType::Float4 | DataType::Matrix => 4,
            DataType::Double | DataType::Closure => 8,
        }
    }

    /// Number of f32 lanes for the composite float types.
    pub fn lanes(self) -> Option<u32> {
        match self {
            DataType::Float3 => Some(3),
            DataType::Float4 => Some(4),
            DataType::Matrix => Some(16),
            _ => None,
        }
    }

    /// Composite types are always passed by pointer across the shader ABI.
    pub fn is_aggregate(self) -> bool {
        matches!(self, DataType::Float3 | DataType::Float4 | DataType::Matrix)
    }

    pub fn is_vector(self) -> bool {
        matches!(self, DataType::Float3 | DataType::Float4)
    }

    pub fn is_numeric_scalar(self) -> bool {
        matches!(self, DataType::Int | DataType::Float | DataType::Double)
    }
}

/// Direction of a shader argument.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ArgDirection {
    In,
    Out,
}

/// A literal value of one of the base types, used for argument defaults and
/// global parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShaderValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Double(f64),
    Float3([f32; 3]),
    Float4([f32; 4]),
    Matrix([f32; 16]),
}

impl ShaderValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ShaderValue::Int(_) => DataType::Int,
            ShaderValue::Float(_) => DataType::Float,
            ShaderValue::Bool(_) => DataType::Bool,
            ShaderValue::Double(_) => DataType::Double,
            ShaderValue::Float3(_) => DataType::Float3,
            ShaderValue::Float4(_) => DataType::Float4,
            ShaderValue::Matrix(_) => DataType::Matrix,
        }
    }

    /// The f32 lanes of a composite value.
    pub(crate) fn lanes(&self) -> Option<&[f32]> {
        match self {
            ShaderValue::Float3(v) => Some(v),
            ShaderValue::Float4(v) => Some(v),
            ShaderValue::Matrix(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_table() {
        assert_eq!(DataType::Float3.size(), 12);
        assert_eq!(DataType::Float4.size(), 16);
        assert_eq!(DataType::Matrix.size(), 64);
        assert_eq!(DataType::Closure.size(), 8);
        assert_eq!(DataType::Double.align(), 8);
        assert_eq!(DataType::Bool.size(), 1);
    }

    #[test]
    fn display_names() {
        assert_eq!(DataType::Float3.to_string(), "float3");
        assert_eq!(DataType::Closure.to_string(), "closure");
        assert_eq!(ArgDirection::Out.to_string(), "out");
    }
}
