// Copyright 2024 the tjs authors. MIT license.

//! The thin `deno_core` extension binding the running script to the
//! process it was launched from: `Deno.args` and nothing else yet.
//! Binding the rest of spec §6's scripting API (fetch, serve,
//! upgradeWebSocket, TLS `connect`/`listen`) onto `deno_core::op2` ops
//! is future work for the op layer above this crate.

use std::cell::RefCell;
use std::rc::Rc;

use deno_core::op2;
use deno_core::OpState;

#[op2]
#[serde]
fn op_tjs_args(state: Rc<RefCell<OpState>>) -> Vec<String> {
  state.borrow().borrow::<Vec<String>>().clone()
}

deno_core::extension!(
  tjs_runtime_ext,
  ops = [op_tjs_args],
  options = {
    script_args: Vec<String>,
  },
  state = |state, options| {
    state.put(options.script_args);
  },
);
