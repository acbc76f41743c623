/// Native routine with the calling convention of generated code: input nonzero
/// buffers, output nonzero buffers and the work array. Returns zero on success and the
/// index of the failed assertion plus one otherwise.
pub type RawProgram = extern "C" fn(*const *const f64, *const *mut f64, *mut f64) -> i64;
