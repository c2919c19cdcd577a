//! Per-request rendering of template tokens inside the merged configuration.
//!
//! The canonical YAML is scanned for single-line tokens bounded by the
//! configured delimiters. Each token is evaluated as a Handlebars expression
//! against the request's claim map plus a fixed helper library. A token that
//! fails to parse or evaluate is left in place untouched; validation decides
//! afterwards whether the structure still holds together.

use std::env;
use std::fs;
use std::io::{BufRead, BufReader};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use handlebars::{
    Context, Handlebars, Helper, HelperDef, RenderContext, RenderError, RenderErrorReason,
    ScopedJson,
};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::TemplateParams;

fn render_error(message: impl Into<String>) -> RenderError {
    RenderErrorReason::Other(message.into()).into()
}

fn param_string(h: &Helper<'_>, index: usize, helper: &str) -> Result<String, RenderError> {
    let value = h
        .param(index)
        .ok_or_else(|| render_error(format!("{helper}: missing argument {index}")))?
        .value();
    Ok(json_to_string(value))
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_result(value: String) -> Result<ScopedJson<'static>, RenderError> {
    Ok(ScopedJson::Derived(Value::String(value)))
}

/// Substitute `$VAR` and `${VAR}` references from the process environment.
/// Unset variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static regex");
    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            env::var(name).unwrap_or_default()
        })
        .into_owned()
}

// Helpers implement `call_inner` so they compose as subexpressions,
// e.g. `{{ b64encode (trim (env "SEED")) }}`.

struct B64EncodeHelper;

impl HelperDef for B64EncodeHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        string_result(BASE64_STANDARD.encode(param_string(h, 0, "b64encode")?))
    }
}

struct TrimHelper;

impl HelperDef for TrimHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        string_result(param_string(h, 0, "trim")?.trim().to_string())
    }
}

struct ConcatHelper;

impl HelperDef for ConcatHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let mut joined = param_string(h, 0, "concat")?;
        joined.push_str(&param_string(h, 1, "concat")?);
        string_result(joined)
    }
}

struct EnvHelper;

impl HelperDef for EnvHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let name = param_string(h, 0, "env")?;
        string_result(env::var(name).unwrap_or_default())
    }
}

struct ExpandEnvHelper;

impl HelperDef for ExpandEnvHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        string_result(expand_env(&param_string(h, 0, "expandEnv")?))
    }
}

struct ReadFileHelper;

impl HelperDef for ReadFileHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let path = expand_env(&param_string(h, 0, "readFile")?);
        trace!(path = %path, "template readFile");
        let content = fs::read_to_string(&path)
            .map_err(|err| render_error(format!("readFile {path}: {err}")))?;
        string_result(content)
    }
}

struct ReadNthLineHelper;

impl HelperDef for ReadNthLineHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let n = h
            .param(0)
            .and_then(|p| p.value().as_i64())
            .ok_or_else(|| render_error("readNthLine: first argument must be a line number"))?;
        if n < 1 {
            return Err(render_error("readNthLine: line numbers are 1-indexed"));
        }
        let path = expand_env(&param_string(h, 1, "readNthLine")?);
        trace!(line = n, path = %path, "template readNthLine");

        let file = fs::File::open(&path)
            .map_err(|err| render_error(format!("readNthLine {path}: {err}")))?;
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| render_error(format!("readNthLine {path}: {err}")))?;
            if index as i64 == n - 1 {
                return string_result(line);
            }
        }
        // Past end of file: empty result, matching a scan that found nothing.
        string_result(String::new())
    }
}

struct StrJoinHelper;

impl HelperDef for StrJoinHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let list = h
            .param(0)
            .ok_or_else(|| render_error("strJoin: missing list argument"))?
            .value();
        let items: Vec<String> = match list {
            Value::Array(values) => values.iter().map(json_to_string).collect(),
            other => vec![json_to_string(other)],
        };
        let separator = match h.param(1) {
            Some(sep) => {
                let sep = json_to_string(sep.value());
                if sep.is_empty() { ",".to_string() } else { sep }
            }
            None => ",".to_string(),
        };
        string_result(items.join(&separator))
    }
}

fn registry() -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(true);
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_helper("b64encode", Box::new(B64EncodeHelper));
    hb.register_helper("trim", Box::new(TrimHelper));
    hb.register_helper("concat", Box::new(ConcatHelper));
    hb.register_helper("env", Box::new(EnvHelper));
    hb.register_helper("expandEnv", Box::new(ExpandEnvHelper));
    hb.register_helper("readFile", Box::new(ReadFileHelper));
    hb.register_helper("readNthLine", Box::new(ReadNthLineHelper));
    hb.register_helper("strJoin", Box::new(StrJoinHelper));
    hb
}

/// Undo YAML double-quoted scalar escapes so the expression parser sees the
/// author's original quoting.
fn unescape_yaml(input: &str) -> String {
    input.replace("\\\"", "\"").replace("\\\\", "\\")
}

/// Render every template token in `content` against `ctx`.
pub fn render_all(
    content: &str,
    ctx: &serde_json::Map<String, Value>,
    params: &TemplateParams,
) -> String {
    let pattern = format!(
        "{}[^\n]*?{}",
        regex::escape(&params.left_delim),
        regex::escape(&params.right_delim)
    );
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(err) => {
            debug!(error = %err, "template delimiters produced an invalid pattern");
            return content.to_string();
        }
    };

    let hb = registry();
    let context = Value::Object(ctx.clone());

    re.replace_all(content, |caps: &regex::Captures<'_>| {
        let token = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        match try_render(&hb, token, &context, params) {
            Some(rendered) => rendered,
            None => token.to_string(),
        }
    })
    .into_owned()
}

fn try_render(
    hb: &Handlebars<'_>,
    token: &str,
    context: &Value,
    params: &TemplateParams,
) -> Option<String> {
    let inner = token
        .strip_prefix(params.left_delim.as_str())?
        .strip_suffix(params.right_delim.as_str())?;
    let expression = unescape_yaml(inner);
    let template = format!("{{{{{expression}}}}}");

    match hb.render_template(&template, context) {
        Ok(rendered) => {
            trace!(token = %token, "template rendered");
            Some(rendered)
        }
        Err(err) => {
            trace!(token = %token, error = %err, "template render failed, keeping token");
            None
        }
    }
}
