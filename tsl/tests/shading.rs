//! End-to-end compile/resolve/call tests for single shader units.

use std::sync::Arc;
use tsl::{
    ClosureField, DataType, Error, ShaderInstance, ShadingContext, TslGlobal, CLOSURE_ADD, CLOSURE_MUL,
};

type Global = *mut TslGlobal;

/// Routes the engine's `tracing` output through the test harness; runs once
/// per test binary, later calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn compile(ctx: &ShadingContext, name: &str, source: &str) -> Arc<tsl::ShaderUnitTemplate> {
    init_tracing();
    let mut driver = ctx.begin_shader_unit_compile();
    let mut template = ctx.create_shader_unit_template(name);
    ctx.compile_shader_unit(&mut driver, &mut template, source)
        .unwrap_or_else(|e| panic!("compile of `{}` failed: {}", name, e));
    ctx.finish_shader_unit_compile(driver);
    Arc::new(template)
}

fn compile_err(ctx: &ShadingContext, name: &str, source: &str) -> Error {
    init_tracing();
    let mut driver = ctx.begin_shader_unit_compile();
    let mut template = ctx.create_shader_unit_template(name);
    let err = ctx
        .compile_shader_unit(&mut driver, &mut template, source)
        .expect_err("compile unexpectedly succeeded");
    assert!(!template.is_compiled(), "failed compile must not populate the template");
    err
}

fn resolve(ctx: &ShadingContext, template: &Arc<tsl::ShaderUnitTemplate>) -> ShaderInstance {
    ctx.resolve_shader_instance(template).expect("resolve failed")
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Scenario A: constant shader
////////////////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn constant_shader() {
    let ctx = ShadingContext::new();
    let template = compile(&ctx, "constant", "shader entry(out float o){ o = 3.5; }");
    assert_eq!(template.exposed_arguments().len(), 1);
    assert_eq!(template.exposed_arguments()[0].ty, DataType::Float);

    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(*mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut o = 0.0f32;
    unsafe { entry(&mut o, std::ptr::null_mut()) };
    assert_eq!(o, 3.5);
}

#[test]
fn repeated_calls_are_deterministic() {
    let ctx = ShadingContext::new();
    let template = compile(
        &ctx,
        "det",
        "shader entry(in float x, out float y){ y = x * 2.0 + 1.0; }",
    );
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    for _ in 0..8 {
        let mut y = 0.0f32;
        unsafe { entry(4.0, &mut y, std::ptr::null_mut()) };
        assert_eq!(y, 9.0);
    }
}

#[test]
fn many_instances_per_template() {
    let ctx = ShadingContext::new();
    let template = compile(&ctx, "multi", "shader entry(out float o){ o = 1.25; }");
    let a = resolve(&ctx, &template);
    let b = resolve(&ctx, &template);
    for instance in [&a, &b] {
        let entry: unsafe extern "C" fn(*mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
        let mut o = 0.0f32;
        unsafe { entry(&mut o, std::ptr::null_mut()) };
        assert_eq!(o, 1.25);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Types, promotion, control flow
////////////////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn scalar_outputs() {
    let ctx = ShadingContext::new();
    let template = compile(
        &ctx,
        "scalars",
        r#"
        shader entry(out int i, out bool b, out double d) {
            i = 40 + 2;
            b = 3 < 4;
            d = 1.5;
        }
        "#,
    );
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(*mut i32, *mut u8, *mut f64, Global) =
        unsafe { std::mem::transmute(instance.function_pointer()) };
    let (mut i, mut b, mut d) = (0i32, 0u8, 0f64);
    unsafe { entry(&mut i, &mut b, &mut d, std::ptr::null_mut()) };
    assert_eq!(i, 42);
    assert_eq!(b, 1);
    assert_eq!(d, 1.5);
}

#[test]
fn int_to_float_promotion() {
    let ctx = ShadingContext::new();
    let template = compile(&ctx, "promote", "shader entry(in float x, out float y){ y = x * 2 + 3; }");
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut y = 0.0f32;
    unsafe { entry(4.0, &mut y, std::ptr::null_mut()) };
    assert_eq!(y, 11.0);
}

#[test]
fn branches_and_loops() {
    let ctx = ShadingContext::new();
    let template = compile(
        &ctx,
        "control",
        r#"
        shader entry(in int n, out int sum, out int parity) {
            sum = 0;
            for (int i = 1; i <= n; i = i + 1) {
                if (i % 2 == 0) { continue; }
                sum = sum + i;
            }
            int k = n;
            parity = 0;
            while (k > 0) {
                k = k - 2;
                if (k == 0) { parity = 1; break; }
            }
        }
        "#,
    );
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(i32, *mut i32, *mut i32, Global) =
        unsafe { std::mem::transmute(instance.function_pointer()) };
    let (mut sum, mut parity) = (0i32, -1i32);
    unsafe { entry(7, &mut sum, &mut parity, std::ptr::null_mut()) };
    // 1 + 3 + 5 + 7
    assert_eq!(sum, 16);
    assert_eq!(parity, 0);
    unsafe { entry(6, &mut sum, &mut parity, std::ptr::null_mut()) };
    assert_eq!(sum, 9);
    assert_eq!(parity, 1);
}

#[test]
fn logical_operators_short_circuit() {
    let ctx = ShadingContext::new();
    // the second operand of `&&` divides by zero; short-circuiting must skip it
    let template = compile(
        &ctx,
        "logic",
        r#"
        shader entry(in int d, out int r) {
            if (d != 0 && 10 / d > 1) { r = 1; } else { r = 0; }
        }
        "#,
    );
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(i32, *mut i32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut r = -1i32;
    unsafe { entry(0, &mut r, std::ptr::null_mut()) };
    assert_eq!(r, 0);
    unsafe { entry(4, &mut r, std::ptr::null_mut()) };
    assert_eq!(r, 1);
    unsafe { entry(100, &mut r, std::ptr::null_mut()) };
    assert_eq!(r, 0);
}

#[test]
fn free_functions_and_globals() {
    let ctx = ShadingContext::new();
    let template = compile(
        &ctx,
        "helpers",
        r#"
        float gain = 2.0;
        float scaled(float x) { return x * gain; }
        int clamp01(int v) {
            if (v < 0) { return 0; }
            if (v > 1) { return 1; }
            return v;
        }
        shader entry(in float x, in int v, out float y, out int c) {
            y = scaled(x) + 1.0;
            c = clamp01(v);
        }
        "#,
    );
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(f32, i32, *mut f32, *mut i32, Global) =
        unsafe { std::mem::transmute(instance.function_pointer()) };
    let (mut y, mut c) = (0f32, 0i32);
    unsafe { entry(5.0, 9, &mut y, &mut c, std::ptr::null_mut()) };
    assert_eq!(y, 11.0);
    assert_eq!(c, 1);
}

#[test]
fn builtin_math() {
    unsafe extern "C" fn host_sqrtf(x: f32) -> f32 {
        x.sqrt()
    }
    let ctx = ShadingContext::new();
    ctx.register_host_symbol("sqrtf", host_sqrtf as *const u8);
    let template = compile(&ctx, "math", "shader entry(in float x, out float y){ y = sqrt(x) + 1.0; }");
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut y = 0.0f32;
    unsafe { entry(16.0, &mut y, std::ptr::null_mut()) };
    assert_eq!(y, 5.0);
}

#[test]
fn vector_arithmetic_and_swizzles() {
    let ctx = ShadingContext::new();
    let template = compile(
        &ctx,
        "vectors",
        r#"
        shader entry(in float3 a, in float3 b, out float3 c, out float m) {
            c = a + b * 2.0;
            c.x = c.x + 1.0;
            m = c.x + c.y + c.z;
        }
        "#,
    );
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(*const [f32; 3], *const [f32; 3], *mut [f32; 3], *mut f32, Global) =
        unsafe { std::mem::transmute(instance.function_pointer()) };
    let a = [1.0f32, 2.0, 3.0];
    let b = [10.0f32, 20.0, 30.0];
    let mut c = [0.0f32; 3];
    let mut m = 0.0f32;
    unsafe { entry(&a, &b, &mut c, &mut m, std::ptr::null_mut()) };
    assert_eq!(c, [22.0, 42.0, 63.0]);
    assert_eq!(m, 127.0);
}

#[test]
fn structures() {
    let ctx = ShadingContext::new();
    let template = compile(
        &ctx,
        "structs",
        r#"
        struct Surface {
            float3 color;
            float roughness;
        };
        shader entry(in float r, out float o) {
            Surface s;
            s.color = float3(0.5);
            s.roughness = r;
            Surface t = s;
            t.roughness = t.roughness * 2.0;
            o = t.color.x + t.roughness + s.roughness;
        }
        "#,
    );
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut o = 0.0f32;
    unsafe { entry(0.25, &mut o, std::ptr::null_mut()) };
    assert_eq!(o, 0.5 + 0.5 + 0.25);
}

#[test]
fn options_can_disable_optimization_and_verification() {
    let ctx = ShadingContext::new();
    let mut driver = ctx.begin_shader_unit_compile();
    let mut template = ctx.create_shader_unit_template("plain");
    template.set_allow_optimization(false);
    template.set_allow_verification(false);
    ctx.compile_shader_unit(&mut driver, &mut template, "shader entry(out float o){ o = 2.5; }")
        .unwrap();
    let template = Arc::new(template);
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(*mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut o = 0.0f32;
    unsafe { entry(&mut o, std::ptr::null_mut()) };
    assert_eq!(o, 2.5);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Scenario B: closures
////////////////////////////////////////////////////////////////////////////////////////////////////

#[repr(C)]
#[derive(Clone, Copy)]
struct LambertNode {
    id: i32,
    base_color: [f32; 3],
}

unsafe extern "C" fn allocate_node(size: u32) -> *mut u8 {
    let layout = std::alloc::Layout::from_size_align(size as usize, 8).expect("layout");
    // tests leak closure nodes; the host renderer owns a real pool
    unsafe { std::alloc::alloc_zeroed(layout) }
}

unsafe extern "C" fn make_lambert(base_color: *const [f32; 3]) -> *mut LambertNode {
    Box::into_raw(Box::new(LambertNode {
        id: 1,
        base_color: unsafe { *base_color },
    }))
}

fn closure_context() -> ShadingContext {
    let ctx = ShadingContext::new();
    let id = ctx
        .register_closure("Lambert", &[ClosureField::new("base_color", DataType::Float3)], 16)
        .unwrap();
    assert_eq!(id, 1);
    ctx.register_host_symbol("make_closure_Lambert", make_lambert as *const u8);
    ctx.register_host_symbol(tsl::CLOSURE_ALLOCATOR_SYMBOL, allocate_node as *const u8);
    ctx
}

#[test]
fn closure_emission() {
    let ctx = closure_context();
    let template = compile(
        &ctx,
        "lambert",
        "shader entry(out closure c){ c = make_closure<Lambert>(float3(0.5, 0.5, 0.5)); }",
    );
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(*mut *mut LambertNode, Global) =
        unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut c: *mut LambertNode = std::ptr::null_mut();
    unsafe { entry(&mut c, std::ptr::null_mut()) };
    assert!(!c.is_null());
    let node = unsafe { *c };
    assert_eq!(node.id, 1);
    assert_eq!(node.base_color, [0.5, 0.5, 0.5]);
}

#[test]
fn closure_trees() {
    let ctx = closure_context();
    let template = compile(
        &ctx,
        "tree",
        r#"
        shader entry(in float w, out closure c) {
            closure a = make_closure<Lambert>(float3(1.0, 0.0, 0.0));
            closure b = make_closure<Lambert>(float3(0.0, 1.0, 0.0));
            c = a + w * b;
        }
        "#,
    );
    let instance = resolve(&ctx, &template);
    let entry: unsafe extern "C" fn(f32, *mut *mut tsl::ClosureTreeNodeBase, Global) =
        unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut c: *mut tsl::ClosureTreeNodeBase = std::ptr::null_mut();
    unsafe { entry(0.75, &mut c, std::ptr::null_mut()) };
    assert!(!c.is_null());

    unsafe {
        let add = &*(c as *const tsl::ClosureTreeNodeAdd);
        assert_eq!(add.id, CLOSURE_ADD);
        let left = &*(add.left as *const LambertNode);
        assert_eq!(left.id, 1);
        assert_eq!(left.base_color, [1.0, 0.0, 0.0]);
        let mul = &*(add.right as *const tsl::ClosureTreeNodeMul);
        assert_eq!(mul.id, CLOSURE_MUL);
        assert_eq!(mul.weight, 0.75);
        let child = &*(mul.child as *const LambertNode);
        assert_eq!(child.base_color, [0.0, 1.0, 0.0]);
    }
}

#[test]
fn closure_tree_node_layouts_match_host() {
    assert_eq!(std::mem::size_of::<tsl::ClosureTreeNodeBase>(), 4);
    assert_eq!(std::mem::size_of::<tsl::ClosureTreeNodeAdd>(), 24);
    assert_eq!(std::mem::size_of::<tsl::ClosureTreeNodeMul>(), 16);
    assert_eq!(std::mem::offset_of!(tsl::ClosureTreeNodeAdd, left), 8);
    assert_eq!(std::mem::offset_of!(tsl::ClosureTreeNodeAdd, right), 16);
    assert_eq!(std::mem::offset_of!(tsl::ClosureTreeNodeMul, weight), 4);
    assert_eq!(std::mem::offset_of!(tsl::ClosureTreeNodeMul, child), 8);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Failure modes
////////////////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn parse_failure() {
    let ctx = ShadingContext::new();
    let err = compile_err(&ctx, "bad", "shader entry(out float o){ o = ; }");
    assert!(matches!(err, Error::ParseFailed(_)), "got {:?}", err);
}

#[test]
fn codegen_failure_unknown_symbol() {
    let ctx = ShadingContext::new();
    let err = compile_err(&ctx, "bad", "shader entry(out float o){ o = bogus; }");
    match err {
        Error::CodegenFailed(detail) => assert!(detail.contains("unknown symbol")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn codegen_failure_type_mismatch() {
    let ctx = ShadingContext::new();
    let err = compile_err(&ctx, "bad", "shader entry(out int o){ o = 1.5; }");
    assert!(matches!(err, Error::CodegenFailed(_)), "got {:?}", err);
}

#[test]
fn missing_shader_entry() {
    let ctx = ShadingContext::new();
    let err = compile_err(&ctx, "bad", "float f(float x) { return x; }");
    assert!(matches!(err, Error::CodegenFailed(_)), "got {:?}", err);
}

#[test]
fn unregistered_closure() {
    let ctx = ShadingContext::new();
    let err = compile_err(
        &ctx,
        "bad",
        "shader entry(out closure c){ c = make_closure<Ghost>(); }",
    );
    match err {
        Error::UnregisteredClosureTouched(name) => assert_eq!(name, "Ghost"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn closure_registration_rules() {
    init_tracing();
    let ctx = ShadingContext::new();
    assert!(matches!(
        ctx.register_closure("Zero", &[], 0),
        Err(Error::InvalidClosureSchema)
    ));
    let first = ctx
        .register_closure("Lambert", &[ClosureField::new("base_color", DataType::Float3)], 16)
        .unwrap();
    let second = ctx
        .register_closure("Lambert", &[ClosureField::new("base_color", DataType::Float3)], 16)
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn resolving_an_uncompiled_template_fails() {
    let ctx = ShadingContext::new();
    let template = Arc::new(ctx.create_shader_unit_template("empty"));
    assert!(matches!(
        ctx.resolve_shader_instance(&template),
        Err(Error::InvalidInput)
    ));
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Scenario F: concurrent compiles
////////////////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn concurrent_compile_and_resolve() {
    let ctx = ShadingContext::new();
    std::thread::scope(|scope| {
        for thread in 0..16 {
            let ctx = &ctx;
            scope.spawn(move || {
                let name = format!("concurrent_{}", thread);
                let template = compile(ctx, &name, "shader entry(out float o){ o = 3.5; }");
                let instance = resolve(ctx, &template);
                let entry: unsafe extern "C" fn(*mut f32, Global) =
                    unsafe { std::mem::transmute(instance.function_pointer()) };
                let mut o = 0.0f32;
                unsafe { entry(&mut o, std::ptr::null_mut()) };
                assert_eq!(o, 3.5);
            });
        }
    });
}
