//! Adapters turning plain Rust functions into node bodies.
//!
//! Closures of arity 1 to 6 are adapted through [`IntoNodeFunction`]
//! (infallible) and [`IntoFallibleNodeFunction`] (returning `Result`). The
//! port layout is read off the closure's signature at compile time; a `()`
//! return yields a node without outputs. Nodes with several outputs are
//! described explicitly with [`PortFunction`].

use std::sync::Arc;

use crate::any::{downcast_value, into_value, FlowValue, Value, ValueType};

/// The body of a node together with its port layout
pub trait NodeFunction: Send + Sync + 'static {
    fn input_types(&self) -> Vec<ValueType>;

    fn output_types(&self) -> Vec<ValueType>;

    /// Runs the body. `args` holds one value per input, in port order; the
    /// result must hold one value per output.
    ///
    /// The node keeps a clone of `args` for every invocation so a failure
    /// can report the arguments it was called with. Large payloads should
    /// travel as `Arc<T>` to keep that clone cheap.
    fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Vec<Value>>;
}

/// Positional access to the arguments of one invocation
pub struct Arguments {
    values: std::vec::IntoIter<Value>,
    position: usize,
}

impl Arguments {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter(),
            position: 0,
        }
    }

    /// Takes the next argument as a `T`
    pub fn take<T: 'static>(&mut self) -> anyhow::Result<T> {
        let position = self.position;
        self.position += 1;
        let value = self
            .values
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing argument {}", position))?;
        Ok(downcast_value::<T>(value, &format!("argument {}", position))?)
    }

    pub fn remaining(&self) -> usize {
        self.values.len()
    }
}

type Body = dyn Fn(Arguments) -> anyhow::Result<Vec<Value>> + Send + Sync;

/// A node body with an explicitly declared port layout
pub struct PortFunction {
    inputs: Vec<ValueType>,
    outputs: Vec<ValueType>,
    body: Box<Body>,
}

impl PortFunction {
    pub fn new<F>(inputs: Vec<ValueType>, outputs: Vec<ValueType>, body: F) -> Self
    where
        F: Fn(Arguments) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            inputs,
            outputs,
            body: Box::new(body),
        }
    }
}

impl NodeFunction for PortFunction {
    fn input_types(&self) -> Vec<ValueType> {
        self.inputs.clone()
    }

    fn output_types(&self) -> Vec<ValueType> {
        self.outputs.clone()
    }

    fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Vec<Value>> {
        (self.body)(Arguments::new(args))
    }
}

/// Conversion of an infallible closure into a node body.
///
/// `Marker` is the closure's `fn` signature; it only keeps the per-arity
/// implementations apart.
pub trait IntoNodeFunction<Marker> {
    fn into_node_function(self) -> Arc<dyn NodeFunction>;
}

/// Conversion of a closure returning `Result<R, E>` into a node body
pub trait IntoFallibleNodeFunction<Marker> {
    fn into_node_function(self) -> Arc<dyn NodeFunction>;
}

impl IntoNodeFunction<()> for PortFunction {
    fn into_node_function(self) -> Arc<dyn NodeFunction> {
        Arc::new(self)
    }
}

fn output_types_of<R: 'static>() -> Vec<ValueType> {
    let output = ValueType::of::<R>();
    if output.is_unit() {
        Vec::new()
    } else {
        vec![output]
    }
}

fn outputs_of<R: FlowValue>(result: R) -> Vec<Value> {
    if ValueType::of::<R>().is_unit() {
        Vec::new()
    } else {
        vec![into_value(result)]
    }
}

macro_rules! impl_node_function {
    ($($arg:ident),+) => {
        impl<F, R, $($arg,)+> IntoNodeFunction<fn($($arg),+) -> R> for F
        where
            F: Fn($($arg),+) -> R + Send + Sync + 'static,
            R: FlowValue,
            $($arg: FlowValue,)+
        {
            fn into_node_function(self) -> Arc<dyn NodeFunction> {
                Arc::new(PortFunction::new(
                    vec![$(ValueType::of::<$arg>()),+],
                    output_types_of::<R>(),
                    move |mut args: Arguments| {
                        #[allow(non_snake_case)]
                        let ($($arg,)+) = ($(args.take::<$arg>()?,)+);
                        Ok(outputs_of((self)($($arg),+)))
                    },
                ))
            }
        }

        impl<F, R, E, $($arg,)+> IntoFallibleNodeFunction<fn($($arg),+) -> Result<R, E>> for F
        where
            F: Fn($($arg),+) -> Result<R, E> + Send + Sync + 'static,
            R: FlowValue,
            E: Into<anyhow::Error>,
            $($arg: FlowValue,)+
        {
            fn into_node_function(self) -> Arc<dyn NodeFunction> {
                Arc::new(PortFunction::new(
                    vec![$(ValueType::of::<$arg>()),+],
                    output_types_of::<R>(),
                    move |mut args: Arguments| {
                        #[allow(non_snake_case)]
                        let ($($arg,)+) = ($(args.take::<$arg>()?,)+);
                        let result = (self)($($arg),+).map_err(Into::<anyhow::Error>::into)?;
                        Ok(outputs_of(result))
                    },
                ))
            }
        }
    };
}

impl_node_function!(A1);
impl_node_function!(A1, A2);
impl_node_function!(A1, A2, A3);
impl_node_function!(A1, A2, A3, A4);
impl_node_function!(A1, A2, A3, A4, A5);
impl_node_function!(A1, A2, A3, A4, A5, A6);

/// Diagnostic name built from the port types, e.g. `i32 * i32 -> i32`
pub fn signature_name(inputs: &[ValueType], outputs: &[ValueType]) -> String {
    let join = |types: &[ValueType]| {
        types
            .iter()
            .map(|t| t.short_name())
            .collect::<Vec<_>>()
            .join(" * ")
    };
    let outputs = if outputs.is_empty() {
        "()".to_string()
    } else {
        join(outputs)
    };
    format!("{} -> {}", join(inputs), outputs)
}
