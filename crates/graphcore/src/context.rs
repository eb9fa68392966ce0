use crate::expression::Expression;
use crate::{ExpressionError, Value, ValueType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

/// Identifier under which the evaluating node's own id is visible.
pub const NODE_ID_IDENTIFIER: &str = "id";

/// Seeded randomness plus the identifiers visible to parameter expressions
/// during one generation run.
///
/// Seeds for independently randomised stages are drawn from a single
/// context with [`ExecutionContext::next_seed`], so a fixed root seed makes
/// the whole run reproducible as long as the draws happen in a fixed order
/// (typically while the graph is being built, before anything is scheduled).
pub struct ExecutionContext {
    seed: u64,
    rng: Mutex<StdRng>,
    bindings: RwLock<HashMap<String, Value>>,
}

impl ExecutionContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Root seed this context was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Draws the next child seed.
    pub fn next_seed(&self) -> u64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen::<u64>()
    }

    /// A context for a sub-stage: seeded from this context's next draw, and
    /// starting with a copy of its bindings.
    pub fn child(&self) -> ExecutionContext {
        let child = ExecutionContext::new(self.next_seed());
        let bindings = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        *child.bindings.write().unwrap_or_else(PoisonError::into_inner) = bindings;
        child
    }

    /// Makes `name` visible to expressions evaluated in this context.
    pub fn define(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Evaluates `expression` on behalf of the node `identifier` and coerces
    /// the result to `expected`.
    ///
    /// The node id is visible to the expression as `id`. Evaluation never
    /// draws from the random generator, so calling this repeatedly has no
    /// effect on the run.
    pub fn get_value(
        &self,
        expression: &str,
        identifier: &str,
        expected: ValueType,
    ) -> Result<Value, ExpressionError> {
        let parsed = Expression::parse(expression)?;
        let value = parsed.evaluate(
            |name| {
                if name == NODE_ID_IDENTIFIER {
                    Some(Value::Str(identifier.to_string()))
                } else {
                    self.lookup(name)
                }
            },
            identifier,
        )?;

        let actual = value.type_name();
        value.coerce(expected).ok_or_else(|| ExpressionError::Type {
            expression: expression.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}
