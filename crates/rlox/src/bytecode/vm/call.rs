//! Call dispatch, property access, and upvalue capture.
//!
//! Everything that pushes or rewires call frames lives here: the call
//! protocol for closures, classes, bound methods, and natives; field and
//! method lookup including the fused invoke paths; and the open-upvalue
//! list shared with the dispatch loop.

use super::{CallFrame, FRAMES_MAX, Vm};
use crate::{
    error::RuntimeError,
    heap::{HeapData, HeapId},
    io::PrintWriter,
    natives::NativeCtx,
    object::{BoundMethod, Instance, Upvalue},
    table::Table,
    tracer::VmTracer,
    value::Value,
};

impl<P: PrintWriter, Tr: VmTracer> Vm<P, Tr> {
    /// Calls `callee` with `arg_count` arguments sitting above it on the
    /// stack.
    pub(super) fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        if let Value::Obj(id) = callee {
            match self.heap.get(id) {
                HeapData::Closure(_) => return self.call_closure(id, arg_count),
                HeapData::Class(_) => return self.call_class(id, arg_count),
                HeapData::BoundMethod(_) => return self.call_bound_method(id, arg_count),
                HeapData::Native(_) => return self.call_native(id, arg_count),
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    /// Pushes a frame for `closure`. Slot 0 of the frame is the callee
    /// itself (the receiver, for methods), followed by the arguments.
    pub(super) fn call_closure(&mut self, closure: HeapId, arg_count: u8) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {arg_count}.")));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let name = self.heap.function(function).name;
        self.tracer.on_call(
            name.map(|id| self.heap.string(id).as_str()),
            self.frames.len() + 1,
        );
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: self.stack.len() - arg_count as usize - 1,
        });
        Ok(())
    }

    /// Calling a class allocates an instance and, when the class defines
    /// `init`, runs it with the arguments. Without `init`, arguments are an
    /// error. The call's result is always the instance.
    fn call_class(&mut self, class: HeapId, arg_count: u8) -> Result<(), RuntimeError> {
        let instance = self.heap.allocate(HeapData::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        let callee_slot = self.stack.len() - arg_count as usize - 1;
        self.stack[callee_slot] = Value::Obj(instance);

        let init_hash = self.heap.string(self.init_string).hash;
        if let Some(initializer) = self.heap.class(class).methods.get(self.init_string, init_hash) {
            let Value::Obj(init_closure) = initializer else {
                unreachable!("methods are closures");
            };
            self.call_closure(init_closure, arg_count)
        } else if arg_count != 0 {
            Err(self.runtime_error(format!("Expected 0 arguments but got {arg_count}.")))
        } else {
            Ok(())
        }
    }

    /// Replaces the callee slot with the receiver, then calls the method.
    fn call_bound_method(&mut self, bound: HeapId, arg_count: u8) -> Result<(), RuntimeError> {
        let (receiver, method) = {
            let HeapData::BoundMethod(BoundMethod { receiver, method }) = self.heap.get(bound) else {
                unreachable!("bound method expected");
            };
            (*receiver, *method)
        };
        let callee_slot = self.stack.len() - arg_count as usize - 1;
        self.stack[callee_slot] = receiver;
        self.call_closure(method, arg_count)
    }

    /// Invokes a native synchronously: no frame is pushed, and collection
    /// cannot run until the native returns, so natives may allocate freely.
    fn call_native(&mut self, native: HeapId, arg_count: u8) -> Result<(), RuntimeError> {
        let HeapData::Native(data) = self.heap.get(native) else {
            unreachable!("native expected");
        };
        let function = data.function;
        let args_start = self.stack.len() - arg_count as usize;
        let result = {
            let mut ctx = NativeCtx::new(&mut self.heap, &mut self.strings, &mut self.print, self.started);
            function(&mut ctx, &self.stack[args_start..])
        };
        match result {
            Ok(value) => {
                // Drop the arguments and the native itself.
                self.stack.truncate(args_start - 1);
                self.push(value);
                Ok(())
            }
            Err(error) => Err(self.runtime_error(error.into_message())),
        }
    }

    // ============================================================
    // Properties
    // ============================================================

    /// `instance.name`: a field if one exists, else the method bound to the
    /// instance.
    pub(super) fn op_get_property(&mut self, name: HeapId) -> Result<(), RuntimeError> {
        let hash = self.heap.string(name).hash;
        let receiver = self.peek(0);
        let lookup = if let Value::Obj(id) = receiver
            && let HeapData::Instance(instance) = self.heap.get(id)
        {
            Some((instance.class, instance.fields.get(name, hash)))
        } else {
            None
        };
        let Some((class, field)) = lookup else {
            return Err(self.runtime_error("Only instances have properties."));
        };

        if let Some(value) = field {
            self.pop();
            self.push(value);
            return Ok(());
        }
        if self.bind_method(class, name, hash) {
            return Ok(());
        }
        let message = format!("Undefined property '{}'.", self.heap.string(name).as_str());
        Err(self.runtime_error(message))
    }

    /// `instance.name = value`: fields are created on first assignment and
    /// may shadow methods. The assigned value stays on the stack.
    pub(super) fn op_set_property(&mut self, name: HeapId) -> Result<(), RuntimeError> {
        let hash = self.heap.string(name).hash;
        let Value::Obj(id) = self.peek(1) else {
            return Err(self.runtime_error("Only instances have fields."));
        };
        let value = self.peek(0);
        match self.heap.get_mut(id) {
            HeapData::Instance(instance) => {
                instance.fields.set(name, hash, value);
            }
            _ => return Err(self.runtime_error("Only instances have fields.")),
        }
        let value = self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    /// `super.name`: binds the method from the superclass sitting on top of
    /// the stack to the receiver below it.
    pub(super) fn op_get_super(&mut self, name: HeapId) -> Result<(), RuntimeError> {
        let hash = self.heap.string(name).hash;
        let Value::Obj(superclass) = self.pop() else {
            unreachable!("superclass slot holds a class");
        };
        if self.bind_method(superclass, name, hash) {
            Ok(())
        } else {
            let message = format!("Undefined property '{}'.", self.heap.string(name).as_str());
            Err(self.runtime_error(message))
        }
    }

    /// Fused `GetProperty` + `Call`. A field shadowing a method is called
    /// like any other value; otherwise the method is invoked directly
    /// without materializing a bound method.
    pub(super) fn op_invoke(&mut self, name: HeapId, arg_count: u8) -> Result<(), RuntimeError> {
        let hash = self.heap.string(name).hash;
        let receiver = self.peek(arg_count as usize);
        let lookup = if let Value::Obj(id) = receiver
            && let HeapData::Instance(instance) = self.heap.get(id)
        {
            Some((instance.class, instance.fields.get(name, hash)))
        } else {
            None
        };
        let Some((class, field)) = lookup else {
            return Err(self.runtime_error("Only instances have methods."));
        };

        if let Some(value) = field {
            let callee_slot = self.stack.len() - arg_count as usize - 1;
            self.stack[callee_slot] = value;
            return self.call_value(value, arg_count);
        }
        self.invoke_from_class(class, name, hash, arg_count)
    }

    /// Looks `name` up in `class`'s method table and calls it with the
    /// receiver already in the callee slot.
    pub(super) fn invoke_from_class(
        &mut self,
        class: HeapId,
        name: HeapId,
        hash: u32,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            let message = format!("Undefined property '{}'.", self.heap.string(name).as_str());
            return Err(self.runtime_error(message));
        };
        let Value::Obj(closure) = method else {
            unreachable!("methods are closures");
        };
        self.call_closure(closure, arg_count)
    }

    /// Pops the receiver and pushes `name` bound to it, if the class has
    /// such a method.
    fn bind_method(&mut self, class: HeapId, name: HeapId, hash: u32) -> bool {
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            return false;
        };
        let Value::Obj(closure) = method else {
            unreachable!("methods are closures");
        };
        let receiver = self.peek(0);
        let bound = self.heap.allocate(HeapData::BoundMethod(BoundMethod {
            receiver,
            method: closure,
        }));
        self.pop();
        self.push(Value::Obj(bound));
        true
    }

    // ============================================================
    // Upvalues
    // ============================================================

    /// Returns the open upvalue for `slot`, creating and splicing one in if
    /// none exists. The list is sorted by slot, highest first, and captures
    /// are shared: two closures over the same variable get the same upvalue.
    pub(super) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let existing = self.open_upvalues[index];
            let Upvalue::Open(existing_slot) = *self.heap.upvalue(existing) else {
                unreachable!("open list holds only open upvalues");
            };
            if existing_slot == slot {
                return existing;
            }
            if existing_slot < slot {
                break;
            }
            index += 1;
        }
        let created = self.heap.allocate(HeapData::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(index, created);
        created
    }

    /// Closes every open upvalue at or above `last`: copies the stack value
    /// into the upvalue and unlinks it. Called on scope exit and on return.
    pub(super) fn close_upvalues(&mut self, last: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let Upvalue::Open(slot) = *self.heap.upvalue(upvalue) else {
                unreachable!("open list holds only open upvalues");
            };
            if slot < last {
                break;
            }
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(self.stack[slot]);
            self.open_upvalues.remove(0);
        }
    }
}
