//! Dependency resolution and start ordering

use crate::runtime::registry::{ProcessSpec, SpecRegistry};
use std::collections::HashMap;

/// Errors raised while resolving the dependency graph
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Unit '{unit}' depends on unknown unit '{dependency}'")]
    DanglingDependency { unit: String, dependency: String },

    #[error("Cyclic dependency involving units: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Produce a start order in which every unit appears after all of its
/// dependencies.
///
/// Depth-first with three-color marking, O(units + edges). The traversal
/// visits roots in registration order and edges in declared order, so the
/// output is deterministic across runs. On a cycle the error names every
/// unit on the cycle.
pub fn resolve(registry: &SpecRegistry) -> Result<Vec<ProcessSpec>, ResolveError> {
    let mut marks: HashMap<&str, Mark> = registry
        .iter()
        .map(|spec| (spec.name.as_str(), Mark::Unvisited))
        .collect();
    let mut stack: Vec<&str> = Vec::new();
    let mut order: Vec<ProcessSpec> = Vec::with_capacity(registry.len());

    for spec in registry.iter() {
        if marks.get(spec.name.as_str()).copied() == Some(Mark::Unvisited) {
            visit(registry, spec, &mut marks, &mut stack, &mut order)?;
        }
    }

    Ok(order)
}

fn visit<'a>(
    registry: &'a SpecRegistry,
    spec: &'a ProcessSpec,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    order: &mut Vec<ProcessSpec>,
) -> Result<(), ResolveError> {
    marks.insert(spec.name.as_str(), Mark::InProgress);
    stack.push(spec.name.as_str());

    for dep_name in &spec.depends_on {
        let dep = registry
            .get(dep_name)
            .map_err(|_| ResolveError::DanglingDependency {
                unit: spec.name.clone(),
                dependency: dep_name.clone(),
            })?;

        match marks.get(dep.name.as_str()).copied() {
            Some(Mark::Done) => {}
            Some(Mark::InProgress) => {
                // The cycle is the stack suffix starting at the dependency
                let start = stack
                    .iter()
                    .position(|name| *name == dep.name.as_str())
                    .unwrap_or(0);
                let cycle = stack[start..].iter().map(|name| name.to_string()).collect();
                return Err(ResolveError::CyclicDependency(cycle));
            }
            _ => visit(registry, dep, marks, stack, order)?,
        }
    }

    stack.pop();
    marks.insert(spec.name.as_str(), Mark::Done);
    order.push(spec.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(order: &[ProcessSpec]) -> Vec<&str> {
        order.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_chain_resolves_in_dependency_order() {
        let mut registry = SpecRegistry::new();
        registry
            .register(ProcessSpec::process("a", "bin/a"))
            .unwrap();
        registry
            .register(ProcessSpec::node("b", "bin/b").needs("a"))
            .unwrap();
        registry
            .register(ProcessSpec::node("c", "bin/c").needs("a").needs("b"))
            .unwrap();

        let order = resolve(&registry).unwrap();
        assert_eq!(names(&order), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_dependency() {
        let mut registry = SpecRegistry::new();
        registry.register(ProcessSpec::node("a", "bin/a")).unwrap();
        registry
            .register(ProcessSpec::node("b", "bin/b").needs("a"))
            .unwrap();
        registry
            .register(ProcessSpec::node("c", "bin/c").needs("a"))
            .unwrap();
        registry
            .register(ProcessSpec::node("d", "bin/d").needs("b").needs("c"))
            .unwrap();

        let order = resolve(&registry).unwrap();
        assert_eq!(names(&order), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_independent_units_keep_registration_order() {
        let mut registry = SpecRegistry::new();
        for name in ["c", "a", "b"] {
            registry.register(ProcessSpec::node(name, "bin")).unwrap();
        }

        let order = resolve(&registry).unwrap();
        assert_eq!(names(&order), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let mut registry = SpecRegistry::new();
        registry.register(ProcessSpec::node("a", "bin/a")).unwrap();
        registry
            .register(ProcessSpec::node("b", "bin/b").needs("a"))
            .unwrap();
        registry
            .register(ProcessSpec::node("c", "bin/c").needs("a"))
            .unwrap();

        let first = names(&resolve(&registry).unwrap())
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let second = names(&resolve(&registry).unwrap())
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        assert_eq!(first, second);
    }

    #[test]
    fn test_two_unit_cycle_names_both_members() {
        let mut registry = SpecRegistry::new();
        registry
            .register(ProcessSpec::node("a", "bin/a").needs("b"))
            .unwrap();
        registry
            .register(ProcessSpec::node("b", "bin/b").needs("a"))
            .unwrap();

        match resolve(&registry) {
            Err(ResolveError::CyclicDependency(cycle)) => {
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("expected cyclic dependency error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut registry = SpecRegistry::new();
        registry
            .register(ProcessSpec::node("a", "bin/a").needs("a"))
            .unwrap();

        match resolve(&registry) {
            Err(ResolveError::CyclicDependency(cycle)) => {
                assert_eq!(cycle, vec!["a".to_string()]);
            }
            other => panic!("expected cyclic dependency error, got {other:?}"),
        }
    }

    #[test]
    fn test_dangling_dependency_is_an_error() {
        let mut registry = SpecRegistry::new();
        registry
            .register(ProcessSpec::node("slam", "bin/slam").needs("simulator"))
            .unwrap();

        match resolve(&registry) {
            Err(ResolveError::DanglingDependency { unit, dependency }) => {
                assert_eq!(unit, "slam");
                assert_eq!(dependency, "simulator");
            }
            other => panic!("expected dangling dependency error, got {other:?}"),
        }
    }
}
