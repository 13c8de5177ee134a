//! Raising exceptions from runtime code.
//!
//! A raise stores the exception bucket in the domain, unwinds the local-roots
//! frames and lock ledgers down to the innermost [`HandlerContext`] and
//! returns a [`Raised`] token. The token is propagated with `?` to the
//! [`Domain::protect`] call that installed the context, which hands the
//! bucket back.
//!
//! Predefined exceptions are looked up in the runtime's global table. Asking
//! for one before the table exists, or on a domain that has not finished
//! initialising, is a fatal bootstrap error.

use crate::domain::Domain;
use crate::error::{BootstrapFault, RaiseResult, Raised, RuntimeError};
use crate::heap::{AllocPath, Heap, Object, MAX_YOUNG_WOSIZE, OBJECT_TAG};
use crate::unwind::HandlerContext;
use crate::value::Value;

/// Exit status of a process killed by an uncaught exception or a bootstrap
/// fault.
pub const FATAL_EXIT_CODE: i32 = 2;

/// Index of a predefined exception in the global table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExnIndex {
    OutOfMemory = 0,
    SysError = 1,
    Failure = 2,
    InvalidArgument = 3,
    EndOfFile = 4,
    ZeroDivide = 5,
    NotFound = 6,
    MatchFailure = 7,
    StackOverflow = 8,
    SysBlockedIo = 9,
    AssertFailure = 10,
    UndefinedRecursiveModule = 11,
    Unhandled = 12,
}

impl ExnIndex {
    pub const ALL: [ExnIndex; 13] = [
        ExnIndex::OutOfMemory,
        ExnIndex::SysError,
        ExnIndex::Failure,
        ExnIndex::InvalidArgument,
        ExnIndex::EndOfFile,
        ExnIndex::ZeroDivide,
        ExnIndex::NotFound,
        ExnIndex::MatchFailure,
        ExnIndex::StackOverflow,
        ExnIndex::SysBlockedIo,
        ExnIndex::AssertFailure,
        ExnIndex::UndefinedRecursiveModule,
        ExnIndex::Unhandled,
    ];

    /// Symbol used in bootstrap diagnostics.
    pub fn symbol(self) -> &'static str {
        match self {
            ExnIndex::OutOfMemory => "OUT_OF_MEMORY_EXN",
            ExnIndex::SysError => "SYS_ERROR_EXN",
            ExnIndex::Failure => "FAILURE_EXN",
            ExnIndex::InvalidArgument => "INVALID_EXN",
            ExnIndex::EndOfFile => "END_OF_FILE_EXN",
            ExnIndex::ZeroDivide => "ZERO_DIVIDE_EXN",
            ExnIndex::NotFound => "NOT_FOUND_EXN",
            ExnIndex::MatchFailure => "MATCH_FAILURE_EXN",
            ExnIndex::StackOverflow => "STACK_OVERFLOW_EXN",
            ExnIndex::SysBlockedIo => "SYS_BLOCKED_IO",
            ExnIndex::AssertFailure => "ASSERT_FAILURE_EXN",
            ExnIndex::UndefinedRecursiveModule => "UNDEFINED_RECURSIVE_MODULE_EXN",
            ExnIndex::Unhandled => "UNHANDLED_EXN",
        }
    }

    /// Name the exception is printed with.
    pub fn name(self) -> &'static str {
        match self {
            ExnIndex::OutOfMemory => "Out_of_memory",
            ExnIndex::SysError => "Sys_error",
            ExnIndex::Failure => "Failure",
            ExnIndex::InvalidArgument => "Invalid_argument",
            ExnIndex::EndOfFile => "End_of_file",
            ExnIndex::ZeroDivide => "Division_by_zero",
            ExnIndex::NotFound => "Not_found",
            ExnIndex::MatchFailure => "Match_failure",
            ExnIndex::StackOverflow => "Stack_overflow",
            ExnIndex::SysBlockedIo => "Sys_blocked_io",
            ExnIndex::AssertFailure => "Assert_failure",
            ExnIndex::UndefinedRecursiveModule => "Undefined_recursive_module",
            ExnIndex::Unhandled => "Unhandled",
        }
    }
}

impl Domain {
    /// Raise `bucket`. With no protected region active the process reports
    /// the exception and exits.
    pub fn raise(&mut self, heap: &Heap, bucket: Value) -> Raised {
        self.exn_bucket = Some(bucket);
        let Some(ctx) = self.handlers.last().copied() else {
            fatal_uncaught_exception(heap, bucket)
        };
        self.unwind_to(ctx);
        Raised::new()
    }

    fn unwind_to(&mut self, ctx: HandlerContext) {
        while self.local_roots.len() > ctx.roots_marker {
            if let Some(mut frame) = self.local_roots.pop() {
                frame.ledger.release_all();
            }
        }
        self.innermost_frame().ledger.release_down_to(ctx.ledger_mark);
        while self.blocking_depth > ctx.blocking_depth {
            self.leave_blocking_section();
        }
        while self.blocking_depth < ctx.blocking_depth {
            self.enter_blocking_section();
        }
    }

    /// Run `body` in a protected region. A raise inside it unwinds back here
    /// and its bucket is returned as the error.
    pub fn protect<T>(
        &mut self,
        heap: &mut Heap,
        body: impl FnOnce(&mut Domain, &mut Heap) -> RaiseResult<T>,
    ) -> Result<T, Value> {
        let depth = self.handlers.len();
        let ledger_mark = self.innermost_frame().ledger.len();
        self.handlers.push(HandlerContext {
            roots_marker: self.local_roots.len(),
            ledger_mark,
            blocking_depth: self.blocking_depth,
        });
        let result = body(self, heap);
        assert_eq!(
            self.handlers.len(),
            depth + 1,
            "protected region left the handler stack unbalanced"
        );
        self.handlers.pop();
        match result {
            Ok(value) => Ok(value),
            Err(_raised) => match self.exn_bucket.take() {
                Some(bucket) => Err(bucket),
                None => panic!("exception raised without a pending bucket"),
            },
        }
    }

    pub fn raise_constant(&mut self, heap: &Heap, tag: Value) -> Raised {
        self.raise(heap, tag)
    }

    pub fn raise_with_arg(&mut self, heap: &mut Heap, tag: Value, arg: Value) -> Raised {
        self.raise_with_args(heap, tag, &[arg])
    }

    pub fn raise_with_args(&mut self, heap: &mut Heap, tag: Value, args: &[Value]) -> Raised {
        assert!(
            1 + args.len() <= MAX_YOUNG_WOSIZE,
            "exception with {} arguments does not fit a young block",
            args.len()
        );
        let mut fields = Vec::with_capacity(1 + args.len());
        fields.push(tag);
        fields.extend_from_slice(args);
        match heap.alloc(Object::Block { tag: 0, fields }, AllocPath::Normal) {
            Ok(bucket) => self.raise(heap, Value::block(bucket)),
            Err(_) => self.raise_out_of_memory(heap),
        }
    }

    pub fn raise_with_string(&mut self, heap: &mut Heap, tag: Value, msg: &str) -> Raised {
        match heap.alloc(Object::Str(msg.to_string()), AllocPath::Normal) {
            Ok(text) => self.raise_with_arg(heap, tag, Value::block(text)),
            Err(_) => self.raise_out_of_memory(heap),
        }
    }

    pub fn get_exception(&self, index: ExnIndex) -> Result<Value, BootstrapFault> {
        let Some(data) = self.runtime.global_data() else {
            return Err(BootstrapFault::Initialisation(index.symbol()));
        };
        if !self.vm_inited {
            return Err(BootstrapFault::DomainCreation(index.symbol()));
        }
        Ok(data.exception(index))
    }

    /// Predefined exception identifier; exits on a bootstrap fault.
    pub fn exception(&self, index: ExnIndex) -> Value {
        match self.get_exception(index) {
            Ok(exn) => exn,
            Err(fault) => fatal_bootstrap(fault),
        }
    }

    pub fn failwith(&mut self, heap: &mut Heap, msg: &str) -> Raised {
        let tag = self.exception(ExnIndex::Failure);
        self.raise_with_string(heap, tag, msg)
    }

    pub fn invalid_argument(&mut self, heap: &mut Heap, msg: &str) -> Raised {
        let tag = self.exception(ExnIndex::InvalidArgument);
        self.raise_with_string(heap, tag, msg)
    }

    pub fn array_bound_error(&mut self, heap: &mut Heap) -> Raised {
        self.invalid_argument(heap, "index out of bounds")
    }

    pub fn raise_out_of_memory(&mut self, heap: &Heap) -> Raised {
        let tag = self.exception(ExnIndex::OutOfMemory);
        self.raise_constant(heap, tag)
    }

    pub fn raise_stack_overflow(&mut self, heap: &Heap) -> Raised {
        let tag = self.exception(ExnIndex::StackOverflow);
        self.raise_constant(heap, tag)
    }

    pub fn raise_sys_error(&mut self, heap: &mut Heap, msg: Value) -> Raised {
        let tag = self.exception(ExnIndex::SysError);
        self.raise_with_arg(heap, tag, msg)
    }

    pub fn raise_end_of_file(&mut self, heap: &Heap) -> Raised {
        let tag = self.exception(ExnIndex::EndOfFile);
        self.raise_constant(heap, tag)
    }

    pub fn raise_zero_divide(&mut self, heap: &Heap) -> Raised {
        let tag = self.exception(ExnIndex::ZeroDivide);
        self.raise_constant(heap, tag)
    }

    pub fn raise_not_found(&mut self, heap: &Heap) -> Raised {
        let tag = self.exception(ExnIndex::NotFound);
        self.raise_constant(heap, tag)
    }

    pub fn raise_sys_blocked_io(&mut self, heap: &Heap) -> Raised {
        let tag = self.exception(ExnIndex::SysBlockedIo);
        self.raise_constant(heap, tag)
    }

    /// Exceptions whose arguments carry a source location.
    pub fn is_special_exception(&self, exn: Value) -> bool {
        exn == self.exception(ExnIndex::MatchFailure)
            || exn == self.exception(ExnIndex::AssertFailure)
            || exn == self.exception(ExnIndex::UndefinedRecursiveModule)
    }

    /// Raise the exception matching a runtime failure.
    pub fn raise_error(&mut self, heap: &mut Heap, err: RuntimeError) -> Raised {
        match err {
            RuntimeError::OutOfMemory => self.raise_out_of_memory(heap),
            RuntimeError::StackOverflow { required, limit } => {
                log::debug!("stack overflow: {required} words needed, limit {limit}");
                self.raise_stack_overflow(heap)
            }
            RuntimeError::InvalidArgument(msg) => self.invalid_argument(heap, &msg),
        }
    }
}

/// Identifier of a raised bucket: the bucket itself for constant exceptions,
/// its first field otherwise.
pub fn exception_tag(heap: &Heap, bucket: Value) -> Value {
    match bucket.as_block() {
        Some(id) if heap.block_tag(id) == Some(0) => heap
            .fields(id)
            .and_then(|f| f.first().copied())
            .unwrap_or(bucket),
        _ => bucket,
    }
}

/// Render an exception bucket as `Name` or `Name(arg, ...)`.
pub fn format_exception(heap: &Heap, bucket: Value) -> String {
    let tag = exception_tag(heap, bucket);
    let name = exception_name(heap, tag).unwrap_or_else(|| format!("{tag:?}"));
    let args: Vec<String> = match bucket.as_block() {
        Some(id) if heap.block_tag(id) == Some(0) => heap
            .fields(id)
            .map(|f| f.iter().skip(1).map(|v| format_arg(heap, *v)).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    if args.is_empty() {
        name
    } else {
        format!("{name}({})", args.join(", "))
    }
}

fn exception_name(heap: &Heap, tag: Value) -> Option<String> {
    let id = tag.as_block()?;
    if heap.block_tag(id) != Some(OBJECT_TAG) {
        return None;
    }
    let name = heap.fields(id)?.first()?.as_block()?;
    heap.string(name).map(str::to_string)
}

fn format_arg(heap: &Heap, value: Value) -> String {
    if let Some(n) = value.as_int() {
        return n.to_string();
    }
    match value.as_block().and_then(|id| heap.string(id)) {
        Some(s) => format!("{s:?}"),
        None => "_".to_string(),
    }
}

fn fatal_uncaught_exception(heap: &Heap, bucket: Value) -> ! {
    let msg = format_exception(heap, bucket);
    log::error!("Fatal error: exception {msg}");
    eprintln!("Fatal error: exception {msg}");
    std::process::exit(FATAL_EXIT_CODE)
}

fn fatal_bootstrap(fault: BootstrapFault) -> ! {
    log::error!("{fault}");
    eprintln!("{fault}");
    std::process::exit(FATAL_EXIT_CODE)
}
