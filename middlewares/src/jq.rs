use std::sync::Arc;

use async_trait::async_trait;
use common::{decode_map, Configurable, Context, Function, Map, Middleware, Value};
use errors::{Error, Result};
use jaq_interpret::{Ctx, FilterT, ParseCtx, RcIter, Val};
use serde::Deserialize;

#[derive(Default, Deserialize)]
struct JqConfig {
    #[serde(default)]
    input: String,
    #[serde(default)]
    output: String,
}

/// Applies jq queries to the input before the fn and/or the output
/// after it. Queries compile at configure time. A query producing a
/// single value yields that value; multiple results yield a sequence.
#[derive(Default)]
pub struct JqMiddleware {
    input: Option<jaq_interpret::Filter>,
    output: Option<jaq_interpret::Filter>,
}

impl JqMiddleware {
    pub fn new() -> JqMiddleware {
        JqMiddleware::default()
    }
}

fn compile(query: &str) -> Result<Option<jaq_interpret::Filter>> {
    if query.is_empty() {
        return Ok(None);
    }

    let mut defs = ParseCtx::new(Vec::new());
    defs.insert_natives(jaq_core::core());

    let (main, parse_errs) = jaq_parse::parse(query, jaq_parse::main());
    if !parse_errs.is_empty() {
        return Err(Error::parse(format!(
            "jq query {query:?}: {parse_errs:?}"
        )));
    }
    let main = main.ok_or_else(|| Error::parse(format!("jq query {query:?} did not parse")))?;

    let filter = defs.compile(main);
    if !defs.errs.is_empty() {
        return Err(Error::parse(format!("jq query {query:?} failed to compile")));
    }

    Ok(Some(filter))
}

fn apply(filter: &Option<jaq_interpret::Filter>, value: Value) -> Result<Value> {
    let Some(filter) = filter else {
        return Ok(value);
    };

    let inputs = RcIter::new(core::iter::empty());
    let mut results = Vec::new();
    for output in filter.run((Ctx::new([], &inputs), Val::from(value.to_json()))) {
        let val = output.map_err(|e| Error::invocation(format!("jq: {e}")))?;
        results.push(Value::from_json(serde_json::Value::from(val)));
    }

    if results.len() == 1 {
        return Ok(results.pop().unwrap_or(Value::Null));
    }
    Ok(Value::Sequence(results))
}

impl Configurable for JqMiddleware {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        let cfg: JqConfig = decode_map(value)?;
        self.input = compile(&cfg.input)?;
        self.output = compile(&cfg.output)?;
        Ok(())
    }
}

#[async_trait]
impl Middleware for JqMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        let input = apply(&self.input, input)?;
        let output = next.invoke(ctx, input).await?;
        apply(&self.output, output)
    }
}
