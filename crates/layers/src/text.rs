//! Text layer: small string transforms.

use async_trait::async_trait;
use layerflow_core::{Layer, LayerError, Value};

use crate::{text_arg, unknown};

pub struct TextLayer;

#[async_trait]
impl Layer for TextLayer {
    fn description(&self) -> &str {
        "String transforms. upper {text}, lower {text}, length {text}, concat {parts, separator?}."
    }

    fn functions(&self) -> Vec<String> {
        ["upper", "lower", "concat", "length"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<Value, LayerError> {
        match function {
            "upper" => Ok(Value::text(text_arg(&args, "text")?.to_uppercase())),
            "lower" => Ok(Value::text(text_arg(&args, "text")?.to_lowercase())),
            "length" => Ok(Value::Num(text_arg(&args, "text")?.chars().count() as f64)),
            "concat" => {
                let separator = args.get("separator").map(|v| v.to_string()).unwrap_or_default();
                let parts = args.get("parts").ok_or_else(|| {
                    LayerError::InvalidArguments("Missing 'parts' argument".into())
                })?;
                let joined = match parts {
                    Value::List(items) => items
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(&separator),
                    single => single.to_string(),
                };
                Ok(Value::text(joined))
            }
            other => Err(unknown("text", other)),
        }
    }
}
