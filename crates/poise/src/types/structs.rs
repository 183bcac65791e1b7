//! User-defined struct templates and instances.
//!
//! A `struct` declaration registers a template in its namespace; calling the
//! template value constructs an instance whose members start as snapshots of
//! the compile-time defaults, with leading positional arguments overriding
//! members in declaration order.

use crate::{
    exception::{ExcType, PoiseException, RunResult},
    heap::{Heap, HeapId},
    object::HeapData,
    value::Value,
};

#[derive(Debug)]
pub struct StructMember {
    pub name: String,
    pub name_hash: u64,
    pub value: Value,
}

#[derive(Debug)]
pub struct Struct {
    name: String,
    name_hash: u64,
    exported: bool,
    members: Vec<StructMember>,
}

impl Struct {
    #[must_use]
    pub fn new(name: String, exported: bool, members: Vec<StructMember>) -> Self {
        let name_hash = crate::intern::hash_string(&name);
        Self {
            name,
            name_hash,
            exported,
            members,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn name_hash(&self) -> u64 {
        self.name_hash
    }

    #[must_use]
    pub fn exported(&self) -> bool {
        self.exported
    }

    #[must_use]
    pub fn members(&self) -> &[StructMember] {
        &self.members
    }

    #[must_use]
    pub fn find_member(&self, member_hash: u64) -> Option<&Value> {
        self.members
            .iter()
            .find(|member| member.name_hash == member_hash)
            .map(|member| &member.value)
    }

    pub fn assign_member(&mut self, member_hash: u64, value: Value) -> Result<Value, Value> {
        match self.members.iter_mut().find(|member| member.name_hash == member_hash) {
            Some(member) => Ok(std::mem::replace(&mut member.value, value)),
            None => Err(value),
        }
    }
}

/// Constructs an instance from a template, consuming `args`.
pub fn construct(heap: &mut Heap, template_id: HeapId, args: Vec<Value>) -> RunResult<Value> {
    let (name, exported, member_count) = {
        let template = heap
            .get(template_id)
            .as_struct()
            .expect("expected Struct template on heap");
        (
            template.name().to_owned(),
            template.exported(),
            template.members().len(),
        )
    };

    if args.len() > member_count {
        let given = args.len();
        for arg in args {
            arg.drop_with_heap(heap);
        }
        return Err(PoiseException::new(
            ExcType::IncorrectArgCount,
            format!("Struct '{name}' has {member_count} members but was given {given} arguments"),
        ));
    }

    let mut members = Vec::with_capacity(member_count);
    {
        let template = heap
            .get(template_id)
            .as_struct()
            .expect("expected Struct template on heap");
        for member in template.members() {
            members.push((member.name.clone(), member.name_hash));
        }
    }

    let mut defaults: Vec<Value> = {
        let h: &Heap = heap;
        let template = h.get(template_id).as_struct().expect("expected Struct template on heap");
        template
            .members()
            .iter()
            .map(|member| member.value.clone_with_heap(h))
            .collect()
    };

    for (index, arg) in args.into_iter().enumerate() {
        let previous = std::mem::replace(&mut defaults[index], arg);
        previous.drop_with_heap(heap);
    }

    let instance_members = members
        .into_iter()
        .zip(defaults)
        .map(|((name, name_hash), value)| StructMember { name, name_hash, value })
        .collect();

    let instance = Struct::new(name, exported, instance_members);
    let id = heap.allocate(HeapData::Struct(instance));
    Ok(Value::Ref(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(heap: &mut Heap) -> HeapId {
        let members = vec![
            StructMember {
                name: "x".into(),
                name_hash: crate::intern::hash_string("x"),
                value: Value::Int(1),
            },
            StructMember {
                name: "y".into(),
                name_hash: crate::intern::hash_string("y"),
                value: Value::None,
            },
        ];
        heap.allocate(HeapData::Struct(Struct::new("Point".into(), false, members)))
    }

    #[test]
    fn construction_snapshots_defaults_and_applies_args() {
        let mut heap = Heap::new();
        let template_id = template(&mut heap);

        let instance = construct(&mut heap, template_id, vec![Value::Int(9)]).unwrap();
        let id = instance.ref_id().unwrap();
        let strukt = heap.get(id).as_struct().unwrap();
        assert!(strukt.find_member(crate::intern::hash_string("x")).unwrap().equals(&Value::Int(9)));
        assert!(strukt.find_member(crate::intern::hash_string("y")).unwrap().equals(&Value::None));

        instance.drop_with_heap(&mut heap);
        heap.dec_ref(template_id);
    }

    #[test]
    fn surplus_arguments_are_rejected() {
        let mut heap = Heap::new();
        let template_id = template(&mut heap);
        let err = construct(
            &mut heap,
            template_id,
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ExcType::IncorrectArgCount);
        heap.dec_ref(template_id);
    }
}
