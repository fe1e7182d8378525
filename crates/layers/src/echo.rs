//! Echo layer: returns its input. Useful for wiring tests and smoke runs.

use async_trait::async_trait;
use layerflow_core::{Layer, LayerError, Value};

use crate::{num_arg, text_arg, unknown};

/// Upper bound for `repeat` so a bad plan cannot allocate without limit.
const MAX_REPEAT: f64 = 1000.0;

pub struct EchoLayer;

#[async_trait]
impl Layer for EchoLayer {
    fn description(&self) -> &str {
        "Echo text back. say {text} returns text; repeat {text, times} returns a list."
    }

    fn functions(&self) -> Vec<String> {
        vec!["say".into(), "repeat".into()]
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<Value, LayerError> {
        match function {
            "say" => match args.get("text") {
                Some(v) => Ok(v.clone()),
                None => Err(LayerError::InvalidArguments("Missing 'text' argument".into())),
            },
            "repeat" => {
                let text = text_arg(&args, "text")?;
                let times = num_arg(&args, "times")?;
                if times < 0.0 || times > MAX_REPEAT || times.fract() != 0.0 {
                    return Err(LayerError::InvalidArguments(format!(
                        "'times' must be a whole number between 0 and {MAX_REPEAT}"
                    )));
                }
                Ok(Value::List(vec![Value::text(text); times as usize]))
            }
            other => Err(unknown("echo", other)),
        }
    }
}
