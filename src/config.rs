use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CountMin, SketchError, UpdatePolicy};

/// Parameters a [`SharedSketch`](crate::SharedSketch) builds its sketch from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SketchConfig {
    pub eps:    f64,
    pub delta:  f64,
    pub seed:   u64,
    pub policy: UpdatePolicy,
}

impl Default for SketchConfig {
    fn default() -> Self {
        SketchConfig {
            eps:    1e-3,
            delta:  1e-3,
            seed:   1,
            policy: UpdatePolicy::Baseline,
        }
    }
}

impl SketchConfig {
    pub fn new(eps: f64, delta: f64, seed: u64, policy: UpdatePolicy) -> Self {
        SketchConfig {
            eps,
            delta,
            seed,
            policy,
        }
    }

    /// Defaults overridden by `CMS_EPS`, `CMS_DELTA`, `CMS_SEED` and
    /// `CMS_USE_CU` when set.
    pub fn from_env() -> Result<Self, SketchError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, SketchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut conf = SketchConfig::default();

        if let Some(eps) = lookup("CMS_EPS") {
            conf.eps = parse(&eps)?;
        }
        if let Some(delta) = lookup("CMS_DELTA") {
            conf.delta = parse(&delta)?;
        }
        if let Some(seed) = lookup("CMS_SEED") {
            conf.seed = parse(&seed)?;
        }
        if let Some(use_cu) = lookup("CMS_USE_CU") {
            conf.policy = if use_cu.trim().eq_ignore_ascii_case("true") {
                UpdatePolicy::Conservative
            } else {
                UpdatePolicy::Baseline
            };
        }

        conf.validate()?;

        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), SketchError> {
        if !(self.eps > 0.0 && self.eps < 1.0)
            || !(self.delta > 0.0 && self.delta < 1.0)
        {
            return Err(SketchError::InvalidParameter);
        }

        Ok(())
    }

    pub fn build(&self) -> Result<CountMin, SketchError> {
        CountMin::from_error_bounds(self.eps, self.delta, self.seed)
    }
}

fn parse<T: FromStr>(value: &str) -> Result<T, SketchError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| SketchError::InvalidParameter)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn lookup(
        vars: &[(&str, &str)],
    ) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let conf = SketchConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(conf, SketchConfig::default());

        let cms = conf.build().unwrap();

        assert_eq!((cms.width(), cms.depth()), (2719, 7));
    }

    #[test]
    fn test_overrides() {
        let conf = SketchConfig::from_lookup(lookup(&[
            ("CMS_EPS", "0.01"),
            ("CMS_DELTA", " 0.05 "),
            ("CMS_SEED", "42"),
            ("CMS_USE_CU", "TRUE"),
        ]))
        .unwrap();

        assert_eq!(
            conf,
            SketchConfig::new(0.01, 0.05, 42, UpdatePolicy::Conservative)
        );

        let conf =
            SketchConfig::from_lookup(lookup(&[("CMS_USE_CU", "no")])).unwrap();

        assert_eq!(conf.policy, UpdatePolicy::Baseline);
    }

    #[test]
    fn test_invalid() {
        for vars in [
            [("CMS_EPS", "abc")],
            [("CMS_EPS", "1.0")],
            [("CMS_DELTA", "0")],
            [("CMS_SEED", "-3")],
        ]
        .iter()
        {
            assert_eq!(
                SketchConfig::from_lookup(lookup(vars)),
                Err(SketchError::InvalidParameter)
            );
        }
    }

    #[test]
    fn test_deserialize_partial() {
        let conf: SketchConfig =
            serde_json::from_str(r#"{"eps": 0.01, "policy": "cu"}"#).unwrap();

        assert_eq!(conf.eps, 0.01);
        assert_eq!(conf.delta, 1e-3);
        assert_eq!(conf.policy, UpdatePolicy::Conservative);
    }
}
