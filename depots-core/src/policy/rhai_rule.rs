//! Rhai rule: a compiled script defining `fn ploy(id, size)`.

use rhai::{CallFnOptions, Dynamic, Engine, Scope, AST};

use super::rule::{Rule, RuleError, RuleLimits, PLOY_FUNC};

const MAX_CALL_LEVELS: usize = 32;
const MAX_EXPR_DEPTH: usize = 64;

/// Engine plus compiled AST. Evaluation keeps no state between calls, so no lock is needed.
/// Only `ploy` runs per evaluation; top-level statements of the script never execute.
pub struct RhaiRule {
    engine: Engine,
    ast: Option<AST>,
}

impl RhaiRule {
    pub fn compile(code: &str, limits: &RuleLimits) -> Result<Self, RuleError> {
        let mut engine = Engine::new();
        engine
            .set_max_operations(limits.max_operations)
            .set_max_call_levels(MAX_CALL_LEVELS)
            .set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH)
            .on_print(|_| {})
            .on_debug(|_, _, _| {});

        let ast = engine
            .compile(code)
            .map_err(|e| RuleError::Compile(e.to_string()))?;
        let defined = ast
            .iter_functions()
            .any(|f| f.name == PLOY_FUNC && f.params.len() == 2);
        if !defined {
            return Err(RuleError::MissingFunction(PLOY_FUNC));
        }
        Ok(Self {
            engine,
            ast: Some(ast),
        })
    }
}

impl Rule for RhaiRule {
    fn evaluate(&self, id: &[u8], size: u64) -> Result<bool, RuleError> {
        let ast = self.ast.as_ref().ok_or(RuleError::Released)?;
        let args = (
            Dynamic::from_blob(id.to_vec()),
            Dynamic::from(i64::try_from(size).unwrap_or(i64::MAX)),
        );
        let options = CallFnOptions::new().eval_ast(false);
        let ret = self
            .engine
            .call_fn_with_options::<Dynamic>(options, &mut Scope::new(), ast, PLOY_FUNC, args)
            .map_err(|e| RuleError::Runtime(e.to_string()))?;
        ret.as_bool()
            .map_err(|found| RuleError::WrongReturnType(found.to_string()))
    }

    fn release(&mut self) {
        self.ast = None;
    }
}
