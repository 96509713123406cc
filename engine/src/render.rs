//! Object template rendering.
use std::collections::BTreeMap;

use handlebars::Handlebars;
use serde_json::{Map, Value};

use crate::config::MissingKeyPolicy;
use crate::error::Error;

/// Renders object templates with the reserved variable set.
///
/// Under the `error` policy a reference to an undefined variable fails the
/// render; under `zero` it renders as the empty value.
pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    /// Create a renderer with the given missing-key policy.
    pub fn new(policy: MissingKeyPolicy) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(matches!(policy, MissingKeyPolicy::Error));
        Self { registry }
    }

    /// Register a partial templates can include as `{{> name key=val}}`.
    pub fn register_partial(&mut self, name: &str, content: &str) -> Result<(), Error> {
        self.registry
            .register_partial(name, content)
            .map_err(|err| Error::Template(format!("partial {name}: {err}")))
    }

    /// Render template bytes with the given variables.
    pub fn render(&self, template: &[u8], vars: &TemplateVars) -> Result<Vec<u8>, Error> {
        let template = std::str::from_utf8(template)
            .map_err(|err| Error::Template(format!("template is not utf-8: {err}")))?;
        let rendered = self
            .registry
            .render_template(template, &vars.0)
            .map_err(|err| Error::Template(err.to_string()))?;
        Ok(rendered.into_bytes())
    }
}

/// Variable map handed to the renderer.
///
/// Reserved variables are set first so object input vars win on conflict.
#[derive(Debug, Clone)]
pub struct TemplateVars(Map<String, Value>);

impl TemplateVars {
    /// Start from the reserved variables every template can rely on.
    pub fn new(job_name: &str, uuid: &str) -> Self {
        let mut map = Map::new();
        map.insert("JobName".to_owned(), Value::from(job_name));
        map.insert("UUID".to_owned(), Value::from(uuid));
        Self(map)
    }

    /// Set the `Iteration` variable.
    pub fn iteration(mut self, iteration: usize) -> Self {
        self.0
            .insert("Iteration".to_owned(), Value::from(iteration));
        self
    }

    /// Set the `Replica` variable.
    pub fn replica(mut self, replica: usize) -> Self {
        self.0.insert("Replica".to_owned(), Value::from(replica));
        self
    }

    /// Merge the object's input vars on top of the reserved set.
    pub fn input_vars(mut self, vars: &BTreeMap<String, Value>) -> Self {
        for (key, value) in vars {
            self.0.insert(key.clone(), value.clone());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POD: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: {{JobName}}-{{Iteration}}-{{Replica}}
spec:
  containers:
    - name: main
      image: {{image}}
"#;

    fn vars() -> TemplateVars {
        let input = BTreeMap::from_iter(vec![("image".to_owned(), Value::from("busybox"))]);
        TemplateVars::new("storm", "abc123")
            .iteration(3)
            .replica(2)
            .input_vars(&input)
    }

    #[test]
    fn reserved_variables_render() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let out = renderer.render(POD.as_bytes(), &vars()).expect("render");
        let out = String::from_utf8(out).expect("utf-8");
        assert!(out.contains("name: storm-3-2"));
        assert!(out.contains("image: busybox"));
    }

    #[test]
    fn input_vars_win_over_reserved() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let input = BTreeMap::from_iter(vec![("JobName".to_owned(), Value::from("override"))]);
        let vars = TemplateVars::new("storm", "abc123").input_vars(&input);
        let out = renderer
            .render(b"{{JobName}}", &vars)
            .expect("render should succeed");
        assert_eq!(out, b"override");
    }

    #[test]
    fn missing_key_fails_under_error_policy() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let err = renderer
            .render(b"{{Undefined}}", &TemplateVars::new("storm", "abc123"))
            .expect_err("missing key must fail");
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn missing_key_renders_empty_under_zero_policy() {
        let renderer = Renderer::new(MissingKeyPolicy::Zero);
        let out = renderer
            .render(b"a{{Undefined}}b", &TemplateVars::new("storm", "abc123"))
            .expect("zero policy renders");
        assert_eq!(out, b"ab");
    }

    #[test]
    fn parse_errors_are_template_errors() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let err = renderer
            .render(b"{{unclosed", &TemplateVars::new("storm", "abc123"))
            .expect_err("parse error");
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn partials_take_hash_arguments() {
        let mut renderer = Renderer::new(MissingKeyPolicy::Error);
        renderer
            .register_partial("env_func", "{{name}}={{value}}")
            .expect("partial registers");
        let out = renderer
            .render(
                b"env: {{> env_func name=\"MODE\" value=UUID}}",
                &TemplateVars::new("storm", "abc123"),
            )
            .expect("render with partial");
        assert_eq!(out, b"env: MODE=abc123");
    }
}
