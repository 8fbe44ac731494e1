//! Object, array and scope construction

use super::CodeGenerator;
use crate::ast::{ArrayNode, Block, LiteralValue, ObjectNode, Type};
use crate::bytecode::{helpers, InvokeKind};
use crate::error::{Error, Result};
use crate::shape::{LiteralLayout, MapEntry, PostsetKey, PropertyFlags};

impl<'a> CodeGenerator<'a> {
    /// Replace the current scope with a new field-layout scope object
    /// holding the scope symbols of `block`. `arguments` is the slot of the
    /// arguments object backing parameter properties.
    pub(super) fn create_scope(&mut self, block: &Block, arguments: Option<u16>) -> Result<()> {
        let has_arguments = self.function.has_arguments_view();
        let mut entries = Vec::new();
        for &id in &block.symbols {
            let symbol = self.symbol(id)?;
            if symbol.is_scope() && !symbol.is_internal() {
                entries.push(MapEntry::new(
                    symbol.name(),
                    PropertyFlags::for_symbol(symbol, has_arguments),
                ));
            }
        }
        let map = self.ctx.shapes.field_map(entries);
        let class = self
            .ctx
            .structures
            .resolve(map.field_count(), map.parameter_count());

        self.load_scope()?;
        if map.has_parameters() {
            let arguments = arguments.ok_or_else(|| {
                Error::internal(format!(
                    "scope of {} has parameter properties but no arguments object",
                    self.function.name
                ))
            })?;
            self.method.load(Type::Object, arguments);
        }
        tracing::trace!(function = %self.function.id, class = %class.name, "scope object");
        self.method.new_structure(class, map)?;
        self.store_scope()
    }

    /// Construct an object literal: literal values go into the spill array
    /// and the indexed store at construction, computed values are set
    /// afterwards in declaration order.
    pub(super) fn object_literal(&mut self, node: &ObjectNode) -> Result<()> {
        let layout = LiteralLayout::synthesize(node, self.ctx.shapes);

        self.method.new_array(layout.map.spill_length());
        for preset in &layout.presets {
            self.method.dup()?;
            self.method.push(LiteralValue::Int(preset.spill as i32));
            self.method.push(preset.value.clone());
            self.method.convert(Type::Object)?;
            self.method.array_store()?;
        }

        if layout.has_indexed_store() {
            // (index, value) pairs
            let length = u32::try_from(layout.indexed.len() * 2)
                .map_err(|_| Error::internal("indexed store too large"))?;
            self.method.new_array(length);
            for (i, element) in layout.indexed.iter().enumerate() {
                for (offset, value) in [
                    LiteralValue::Number(f64::from(element.index)),
                    element.value.clone(),
                ]
                .into_iter()
                .enumerate()
                {
                    self.method.dup()?;
                    self.method.push(LiteralValue::Int((i * 2 + offset) as i32));
                    self.method.push(value);
                    self.method.convert(Type::Object)?;
                    self.method.array_store()?;
                }
            }
            self.method
                .invoke(InvokeKind::Static, helpers::allocate_array_data())?;
        } else {
            self.method.push(LiteralValue::Null);
        }

        self.method.new_object(layout.map.clone())?;

        for postset in &layout.postsets {
            let value = &node.properties[postset.property].value;
            self.method.dup()?;
            match &postset.key {
                PostsetKey::Named(key) => {
                    self.load(value, Type::Object)?;
                    self.method.dynamic_set(key, self.base_flags())?;
                }
                PostsetKey::Index(index) => {
                    self.method.push(LiteralValue::Number(f64::from(*index)));
                    self.load(value, Type::Object)?;
                    self.method.dynamic_set_index(self.base_flags())?;
                }
            }
        }
        Ok(())
    }

    pub(super) fn array_literal(&mut self, node: &ArrayNode) -> Result<()> {
        let length = u32::try_from(node.elements.len())
            .map_err(|_| Error::internal("array literal too large"))?;
        self.method.new_array(length);
        for (i, element) in node.elements.iter().enumerate() {
            self.method.dup()?;
            self.method.push(LiteralValue::Int(i as i32));
            self.load(element, Type::Object)?;
            self.method.array_store()?;
        }
        self.method.invoke(InvokeKind::Static, helpers::allocate_array())
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::*;
    use crate::bytecode::Instruction;
    use crate::codegen::tests::Fixture;
    use crate::config::CompilerConfig;

    fn returning(expr: Expression) -> FunctionNode {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[("x", Type::Object)], FunctionFlags::empty());
        f.body.statements = vec![build::return_stmt(Some(expr))];
        f
    }

    #[test]
    fn test_object_literal_presets_and_postsets() {
        let mut f = FunctionNode::new(FunctionId(1), "f", &[("x", Type::Object)], FunctionFlags::empty());
        let literal = build::object(vec![
            ("a", build::int(1)),
            ("b", build::local(&f, "x")),
            ("0", build::string("zero")),
        ]);
        f.body.statements = vec![build::return_stmt(Some(literal))];
        let code = Fixture::new(CompilerConfig::default()).generate(f);
        let entry = &code.methods[0].code;
        let text = entry.disassemble();

        assert!(text.contains("newarray 2"));
        assert!(text.contains("allocateArrayData"));
        assert!(text.contains("dyn_set b"));
        assert!(!text.contains("dyn_set a"));
        assert_eq!(
            entry
                .instructions
                .iter()
                .filter(|i| matches!(i, Instruction::NewObject { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_object_without_indexed_keys_passes_null_store() {
        let code = Fixture::new(CompilerConfig::default())
            .generate(returning(build::object(vec![("k", build::boolean(true))])));
        let entry = &code.methods[0].code;
        assert!(entry
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::Push(LiteralValue::Null))));
        assert!(!entry.disassemble().contains("allocateArrayData"));
    }

    #[test]
    fn test_array_literal_stores_every_element() {
        let code = Fixture::new(CompilerConfig::default()).generate(returning(build::array(vec![
            build::int(1),
            build::num(2.5),
            build::string("three"),
        ])));
        let entry = &code.methods[0].code;
        assert_eq!(
            entry
                .instructions
                .iter()
                .filter(|i| matches!(i, Instruction::ArrayStore))
                .count(),
            3
        );
        assert!(entry.disassemble().contains("allocateArray("));
    }
}
