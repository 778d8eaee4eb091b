//! Custom filters/functions registered into the template engine.
//!
//! ini-escape, quote, sha256-hex, base64, derive-password, render-by-name,
//! and context-accessor, each implemented against Tera's `Filter`/`Function`
//! traits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};
use tera::{Error as TeraError, Function, Result as TeraResult, Tera, Value};

use crate::masterpassword::{MasterPassword, Strength};

fn as_str(value: &Value, name: &str) -> TeraResult<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| TeraError::msg(format!("`{name}` must be a string")))
}

/// Doubles `$`, then wraps the result in double quotes, escaping any
/// embedded quote. Used for INI-style config file rendering.
pub fn ini_escape(value: &Value, _args: &HashMap<String, Value>) -> TeraResult<Value> {
    let input = as_str(value, "value")?;
    let escaped = input.replace('$', "$$").replace('"', "\\\"");
    Ok(Value::String(format!("\"{escaped}\"")))
}

/// Wraps a value in double quotes, escaping any embedded quote. Unlike
/// `ini_escape`, does not double `$`.
pub fn quote(value: &Value, _args: &HashMap<String, Value>) -> TeraResult<Value> {
    let input = as_str(value, "value")?;
    Ok(Value::String(format!("\"{}\"", input.replace('"', "\\\""))))
}

pub fn sha256sum(value: &Value, _args: &HashMap<String, Value>) -> TeraResult<Value> {
    let input = as_str(value, "value")?;
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Ok(Value::String(format!("{:x}", hasher.finalize())))
}

pub fn base64_encode(value: &Value, _args: &HashMap<String, Value>) -> TeraResult<Value> {
    let input = as_str(value, "value")?;
    Ok(Value::String(STANDARD.encode(input.as_bytes())))
}

/// `derive_password(username=.., master_password=.., strength=.., site=..)`.
///
/// Derives a per-site password from a username/master-password pair as a
/// single function call, since Tera globals can't hold per-call state the
/// way a chained object could.
pub struct DerivePassword;

impl Function for DerivePassword {
    fn call(&self, args: &HashMap<String, Value>) -> TeraResult<Value> {
        let username = args
            .get("username")
            .and_then(Value::as_str)
            .ok_or_else(|| TeraError::msg("derive_password requires `username`"))?;
        let master_password = args
            .get("master_password")
            .and_then(Value::as_str)
            .ok_or_else(|| TeraError::msg("derive_password requires `master_password`"))?;
        let site = args
            .get("site")
            .and_then(Value::as_str)
            .ok_or_else(|| TeraError::msg("derive_password requires `site`"))?;
        let strength = match args.get("strength").and_then(Value::as_str) {
            None | Some("long") => Strength::Long,
            Some(other) => {
                return Err(TeraError::msg(format!("unknown password strength {other}")))
            }
        };

        let derived = MasterPassword::new(username, master_password).derive(strength, site);
        Ok(Value::String(derived))
    }

    fn is_safe(&self) -> bool {
        false
    }
}

/// `render(name=.., options={..})` — recursive template lookup. Holds a
/// handle to the same `Tera` instance it is registered into, so a template
/// can render another by path.
pub struct RenderByName {
    tera: Arc<Mutex<Tera>>,
}

impl RenderByName {
    pub fn new(tera: Arc<Mutex<Tera>>) -> Self {
        Self { tera }
    }
}

impl Function for RenderByName {
    fn call(&self, args: &HashMap<String, Value>) -> TeraResult<Value> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TeraError::msg("render requires `name`"))?;
        let options = args.get("options").cloned().unwrap_or(Value::Null);
        let context = tera::Context::from_value(options)
            .map_err(|e| TeraError::msg(format!("render options must be an object: {e}")))?;

        let tera = self
            .tera
            .lock()
            .map_err(|_| TeraError::msg("template engine lock poisoned"))?;
        let rendered = tera
            .render(name, &context)
            .map_err(|e| TeraError::msg(format!("failed to render {name}: {e}")))?;
        Ok(Value::String(rendered))
    }

    fn is_safe(&self) -> bool {
        false
    }
}

/// `context()` — returns the render options currently in scope as a
/// per-render scope object.
pub struct RenderContext {
    current: Arc<Mutex<Value>>,
}

impl RenderContext {
    pub fn new(current: Arc<Mutex<Value>>) -> Self {
        Self { current }
    }
}

impl Function for RenderContext {
    fn call(&self, _args: &HashMap<String, Value>) -> TeraResult<Value> {
        self.current
            .lock()
            .map(|v| v.clone())
            .map_err(|_| TeraError::msg("render scope lock poisoned"))
    }

    fn is_safe(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ini_escape_doubles_dollar_and_quotes() {
        let out = ini_escape(&Value::String("a$b\"c".into()), &HashMap::new()).unwrap();
        assert_eq!(out, Value::String("\"a$$b\\\"c\"".into()));
    }

    #[test]
    fn quote_does_not_double_dollar() {
        let out = quote(&Value::String("a$b".into()), &HashMap::new()).unwrap();
        assert_eq!(out, Value::String("\"a$b\"".into()));
    }

    #[test]
    fn sha256sum_is_hex_and_deterministic() {
        let a = sha256sum(&Value::String("hello".into()), &HashMap::new()).unwrap();
        let b = sha256sum(&Value::String("hello".into()), &HashMap::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a,
            Value::String(
                "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824".to_string()
            )
        );
    }

    #[test]
    fn derive_password_rejects_unknown_strength() {
        let mut args = HashMap::new();
        args.insert("username".to_string(), Value::String("svc".into()));
        args.insert("master_password".to_string(), Value::String("pw".into()));
        args.insert("site".to_string(), Value::String("host".into()));
        args.insert("strength".to_string(), Value::String("short".into()));
        assert!(DerivePassword.call(&args).is_err());
    }
}
