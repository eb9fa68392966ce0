use crate::{ConstructorNode, FactoryNode, InputNode, MethodNode, OutputNode};
use graphcore::{Arguments, GraphError, Operation, OperationError, ParameterSpec, ValueType};
use graphruntime::{OperationMetadata, OperationRegistry, RegistryError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Square grid of `f32` values, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    size: usize,
    data: Vec<f32>,
}

impl Mask {
    pub fn new(size: usize, fill: f32) -> Self {
        Self {
            size,
            data: vec![fill; size * size],
        }
    }

    /// Uniform noise in `[0, 1)`, reproducible from `seed`.
    pub fn noise(size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..size * size).map(|_| rng.gen_range(0.0..1.0)).collect();
        Self { size, data }
    }

    /// Left-to-right ramp from 0 to 1.
    pub fn gradient(size: usize) -> Self {
        let span = size.saturating_sub(1).max(1) as f32;
        let data = (0..size * size).map(|i| (i % size) as f32 / span).collect();
        Self { size, data }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.size + x]
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    /// Pulls every cell towards the minimum of its 4-neighbourhood by
    /// `density` (0 leaves the mask untouched, 1 is a full erosion).
    pub fn erode(&mut self, density: f32) -> &mut Self {
        let density = density.clamp(0.0, 1.0);
        let source = self.data.clone();
        let n = self.size;
        for y in 0..n {
            for x in 0..n {
                let mut low = source[y * n + x];
                if x > 0 {
                    low = low.min(source[y * n + x - 1]);
                }
                if x + 1 < n {
                    low = low.min(source[y * n + x + 1]);
                }
                if y > 0 {
                    low = low.min(source[(y - 1) * n + x]);
                }
                if y + 1 < n {
                    low = low.min(source[(y + 1) * n + x]);
                }
                let cell = &mut self.data[y * n + x];
                *cell += (low - *cell) * density;
            }
        }
        self
    }

    pub fn add(&mut self, other: &Mask) -> Result<&mut Self, MaskError> {
        self.check_size(other)?;
        self.data.iter_mut().zip(&other.data).for_each(|(a, b)| *a += b);
        Ok(self)
    }

    pub fn multiply(&mut self, scale: f32) -> &mut Self {
        self.data.iter_mut().for_each(|v| *v *= scale);
        self
    }

    pub fn clamp(&mut self, min: f32, max: f32) -> &mut Self {
        self.data.iter_mut().for_each(|v| *v = v.clamp(min, max));
        self
    }

    /// Box blur over a `(2 * radius + 1)` square window, clipped at edges.
    pub fn blur(&mut self, radius: usize) -> &mut Self {
        if radius == 0 {
            return self;
        }
        let source = self.data.clone();
        let n = self.size;
        for y in 0..n {
            for x in 0..n {
                let (mut sum, mut count) = (0.0, 0);
                for sy in y.saturating_sub(radius)..(y + radius + 1).min(n) {
                    for sx in x.saturating_sub(radius)..(x + radius + 1).min(n) {
                        sum += source[sy * n + sx];
                        count += 1;
                    }
                }
                self.data[y * n + x] = sum / count as f32;
            }
        }
        self
    }

    /// New mask holding 1 where this one is at least `level`, 0 elsewhere.
    pub fn threshold(&self, level: f32) -> Mask {
        Mask {
            size: self.size,
            data: self.data.iter().map(|&v| if v >= level { 1.0 } else { 0.0 }).collect(),
        }
    }

    fn check_size(&self, other: &Mask) -> Result<(), MaskError> {
        if self.size != other.size {
            return Err(MaskError::SizeMismatch {
                expected: self.size,
                actual: other.size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MaskError {
    #[error("mask size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

impl From<MaskError> for OperationError {
    fn from(err: MaskError) -> Self {
        OperationError::Failed(err.to_string())
    }
}

fn size_arg(args: &Arguments<'_>) -> Result<usize, OperationError> {
    let size = args.int("size")?;
    usize::try_from(size).map_err(|_| OperationError::Failed(format!("mask size must not be negative, got {}", size)))
}

pub fn new_operation() -> Result<Operation, GraphError> {
    ConstructorNode::<Mask>::new("mask.new")
        .param(ParameterSpec::literal("size", ValueType::Int))
        .param(ParameterSpec::literal("fill", ValueType::Float).with_default(0.0))
        .build(|args: &Arguments<'_>| Ok(Mask::new(size_arg(args)?, args.float("fill")? as f32)))
}

pub fn noise_operation() -> Result<Operation, GraphError> {
    FactoryNode::new("mask.noise")
        .param(ParameterSpec::literal("size", ValueType::Int))
        .param(ParameterSpec::literal("seed", ValueType::Int))
        .returns(|args: &Arguments<'_>| Ok(Mask::noise(size_arg(args)?, args.int("seed")? as u64)))
}

pub fn gradient_operation() -> Result<Operation, GraphError> {
    FactoryNode::new("mask.gradient")
        .param(ParameterSpec::literal("size", ValueType::Int))
        .returns(|args: &Arguments<'_>| Ok(Mask::gradient(size_arg(args)?)))
}

pub fn erode_operation() -> Result<Operation, GraphError> {
    MethodNode::<Mask>::new("mask.erode")
        .param(ParameterSpec::literal("density", ValueType::Float))
        .mutating(|mask, args| {
            mask.erode(args.float("density")? as f32);
            Ok(())
        })
}

pub fn add_operation() -> Result<Operation, GraphError> {
    MethodNode::<Mask>::new("mask.add")
        .param(ParameterSpec::artifact::<Mask>("other"))
        .mutating(|mask, args| {
            mask.add(args.shared::<Mask>("other")?)?;
            Ok(())
        })
}

pub fn multiply_operation() -> Result<Operation, GraphError> {
    MethodNode::<Mask>::new("mask.multiply")
        .param(ParameterSpec::literal("scale", ValueType::Float))
        .mutating(|mask, args| {
            mask.multiply(args.float("scale")? as f32);
            Ok(())
        })
}

pub fn clamp_operation() -> Result<Operation, GraphError> {
    MethodNode::<Mask>::new("mask.clamp")
        .param(ParameterSpec::literal("min", ValueType::Float).with_default(0.0))
        .param(ParameterSpec::literal("max", ValueType::Float).with_default(1.0))
        .mutating(|mask, args| {
            mask.clamp(args.float("min")? as f32, args.float("max")? as f32);
            Ok(())
        })
}

pub fn blur_operation() -> Result<Operation, GraphError> {
    MethodNode::<Mask>::new("mask.blur")
        .param(ParameterSpec::literal("radius", ValueType::Int).nullable())
        .mutating(|mask, args| {
            let radius = args.optional_int("radius")?.unwrap_or(1).max(0) as usize;
            mask.blur(radius);
            Ok(())
        })
}

pub fn threshold_operation() -> Result<Operation, GraphError> {
    MethodNode::<Mask>::new("mask.threshold")
        .param(ParameterSpec::literal("level", ValueType::Float))
        .allocating("result", |mask, args| Ok(mask.threshold(args.float("level")? as f32)))
}

/// Register every mask operation with `registry`.
pub fn register_all(registry: &mut OperationRegistry) -> Result<(), MaskSetupError> {
    let operations = [
        (new_operation()?, "constructor", "Constant mask"),
        (noise_operation()?, "factory", "Seeded uniform noise"),
        (gradient_operation()?, "factory", "Horizontal 0..1 ramp"),
        (erode_operation()?, "method", "Erode towards local minimum"),
        (add_operation()?, "method", "Add another mask in place"),
        (multiply_operation()?, "method", "Scale every cell"),
        (clamp_operation()?, "method", "Clamp cells to a range"),
        (blur_operation()?, "method", "Box blur"),
        (threshold_operation()?, "method", "Binary mask of cells above a level"),
        (InputNode::<Mask>::operation("mask.input"), "io", "Externally supplied mask"),
        (OutputNode::<Mask>::operation("mask.output"), "io", "Captured final mask"),
    ];

    let count = operations.len();
    for (operation, category, description) in operations {
        registry.register_with(operation, OperationMetadata::new(category, description))?;
    }
    tracing::info!("Registered {} mask operations", count);
    Ok(())
}

/// Why the mask operations could not be registered
#[derive(Debug, thiserror::Error)]
pub enum MaskSetupError {
    #[error(transparent)]
    Definition(#[from] GraphError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
