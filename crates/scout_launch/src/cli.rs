//! Command-line interface for scout-launch

use crate::config::{ParamValue, ParameterSet};
use argh::FromArgs;

/// Dependency-ordered launch orchestrator for the scout robot stack
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// path to the launch file (default: launch/inspection.launch.yaml)
    #[argh(
        positional,
        default = "String::from(\"launch/inspection.launch.yaml\")"
    )]
    pub launch_file: String,

    /// override a session parameter (format: key:=value, repeatable)
    #[argh(option, short = 'p', from_str_fn(parse_param_override))]
    pub param: Vec<(String, String)>,

    /// show the resolved launch plan without starting anything
    #[argh(switch)]
    pub dry_run: bool,

    /// validate the launch file and exit
    #[argh(switch)]
    pub validate: bool,

    /// print the final report as JSON on stdout
    #[argh(switch)]
    pub report_json: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse a parameter override in the format "key:=value"
fn parse_param_override(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, ":=").collect();
    if parts.len() != 2 {
        return Err(format!(
            "Invalid parameter format '{}'. Expected 'key:=value'",
            s
        ));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

impl LaunchArgs {
    /// Convert overrides into a parameter set. Keys the launch file does not
    /// declare are passed through to the units untouched.
    pub fn param_overrides(&self) -> ParameterSet {
        let mut params = ParameterSet::new();
        for (name, value) in &self.param {
            params.set(name.clone(), ParamValue::parse(value));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param_override() {
        let result = parse_param_override("map_file:=maps/site.yaml");
        assert_eq!(
            result,
            Ok(("map_file".to_string(), "maps/site.yaml".to_string()))
        );
    }

    #[test]
    fn test_parse_param_override_with_extra_separator() {
        let result = parse_param_override("url:=http://localhost:8080");
        assert_eq!(
            result,
            Ok(("url".to_string(), "http://localhost:8080".to_string()))
        );
    }

    #[test]
    fn test_parse_param_override_invalid() {
        let result = parse_param_override("invalid");
        assert!(result.is_err());
    }

    #[test]
    fn test_param_overrides_are_typed() {
        let args = LaunchArgs {
            launch_file: String::new(),
            param: vec![
                ("use_sim_time".to_string(), "false".to_string()),
                ("rate".to_string(), "10".to_string()),
            ],
            dry_run: false,
            validate: false,
            report_json: false,
            log_level: "info".to_string(),
        };

        let overrides = args.param_overrides();
        assert_eq!(
            overrides.get("use_sim_time"),
            Some(&ParamValue::Bool(false))
        );
        assert_eq!(overrides.get("rate"), Some(&ParamValue::Int(10)));
    }
}
