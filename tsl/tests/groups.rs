//! Shader-group wiring, defaults, topology and failure tests.

use std::sync::Arc;
use tsl::{Error, ShaderValue, ShadingContext, TslGlobal};

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

fn resolve_group(ctx: &ShadingContext, group: &mut tsl::ShaderGroupTemplate) -> tsl::ShaderInstance {
    ctx.resolve_shader_group(group).expect("group resolve failed");
    let template = group.as_unit_template().expect("lowered wrapper missing").clone();
    ctx.resolve_shader_instance(&template).expect("instance resolve failed")
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Scenario C: two-unit wiring
////////////////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn two_unit_wiring() {
    let ctx = ShadingContext::new();
    let mul2 = compile(&ctx, "mul2", "shader mul2(in float x, out float y){ y = x * 2.0; }");
    let add3 = compile(&ctx, "add3", "shader add3(in float x, out float y){ y = x + 3.0; }");

    let mut group = ctx.create_shader_group_template("pipeline");
    group.add_unit("mul2", &mul2).unwrap();
    group.add_unit("add3", &add3).unwrap();
    group.connect("mul2", "y", "add3", "x");
    group.expose_input("mul2", "x", 0);
    group.expose_output("add3", "y", 1);
    group.set_root("add3");

    let instance = resolve_group(&ctx, &mut group);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut out = 0.0f32;
    unsafe { entry(4.0, &mut out, std::ptr::null_mut()) };
    assert_eq!(out, 11.0);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Scenario D: default injection
////////////////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn default_injection() {
    let ctx = ShadingContext::new();
    let mul2 = compile(&ctx, "mul2", "shader mul2(in float x, out float y){ y = x * 2.0; }");
    let add3 = compile(&ctx, "add3", "shader add3(in float x, out float y){ y = x + 3.0; }");

    let mut group = ctx.create_shader_group_template("defaults");
    group.add_unit("mul2", &mul2).unwrap();
    group.add_unit("add3", &add3).unwrap();
    // no connection; add3.x comes from the group default
    group.expose_input("mul2", "x", 0);
    group.expose_output("add3", "y", 1);
    group.set_default("add3", "x", ShaderValue::Float(7.0));
    group.set_root("add3");

    let instance = resolve_group(&ctx, &mut group);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut out = 0.0f32;
    unsafe { entry(4.0, &mut out, std::ptr::null_mut()) };
    assert_eq!(out, 10.0);
}

#[test]
fn declared_argument_default_is_the_last_resort() {
    let ctx = ShadingContext::new();
    let addk = compile(
        &ctx,
        "addk",
        "shader addk(in float x, in float k = 3.0, out float y){ y = x + k; }",
    );

    let mut group = ctx.create_shader_group_template("argdefault");
    group.add_unit("addk", &addk).unwrap();
    group.expose_input("addk", "x", 0);
    group.expose_output("addk", "y", 1);
    group.set_root("addk");

    let instance = resolve_group(&ctx, &mut group);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut out = 0.0f32;
    unsafe { entry(2.0, &mut out, std::ptr::null_mut()) };
    assert_eq!(out, 5.0);

    // a group default overrides the declared one
    let mut group = ctx.create_shader_group_template("argdefault2");
    group.add_unit("addk", &addk).unwrap();
    group.expose_input("addk", "x", 0);
    group.expose_output("addk", "y", 1);
    group.set_default("addk", "k", ShaderValue::Float(10.0));
    group.set_root("addk");
    let instance = resolve_group(&ctx, &mut group);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    unsafe { entry(2.0, &mut out, std::ptr::null_mut()) };
    assert_eq!(out, 12.0);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Scenario E: cycles
////////////////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn cycle_rejection() {
    let ctx = ShadingContext::new();
    let forward = compile(&ctx, "forward", "shader f(in float x, out float y){ y = x; }");

    let mut group = ctx.create_shader_group_template("cyclic");
    group.add_unit("f1", &forward).unwrap();
    group.add_unit("f2", &forward).unwrap();
    group.connect("f1", "y", "f2", "x");
    group.connect("f2", "y", "f1", "x");
    group.set_root("f1");

    match ctx.resolve_shader_group(&mut group) {
        Err(Error::ShaderGroupWithCycles) => {}
        other => panic!("expected ShaderGroupWithCycles, got {:?}", other.err()),
    }
    // no partial wrapper is left behind
    assert!(group.as_unit_template().is_none());
}

#[test]
fn self_connection_is_a_cycle() {
    let ctx = ShadingContext::new();
    let forward = compile(&ctx, "forward", "shader f(in float x, out float y){ y = x; }");

    let mut group = ctx.create_shader_group_template("selfcycle");
    group.add_unit("f1", &forward).unwrap();
    group.connect("f1", "y", "f1", "x");
    group.set_root("f1");

    assert!(matches!(
        ctx.resolve_shader_group(&mut group),
        Err(Error::ShaderGroupWithCycles)
    ));
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Topology
////////////////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn single_unit_group_matches_direct_call() {
    let ctx = ShadingContext::new();
    let unit = compile(&ctx, "affine", "shader affine(in float x, out float y){ y = x * 3.0 + 1.0; }");

    // direct
    let direct = ctx.resolve_shader_instance(&unit).unwrap();
    let direct_entry: unsafe extern "C" fn(f32, *mut f32, Global) =
        unsafe { std::mem::transmute(direct.function_pointer()) };

    // through a trivial group that only forwards arguments
    let mut group = ctx.create_shader_group_template("trivial");
    group.add_unit("affine", &unit).unwrap();
    group.expose_input("affine", "x", 0);
    group.expose_output("affine", "y", 1);
    group.set_root("affine");
    let wrapped = resolve_group(&ctx, &mut group);
    let wrapped_entry: unsafe extern "C" fn(f32, *mut f32, Global) =
        unsafe { std::mem::transmute(wrapped.function_pointer()) };

    for x in [0.0f32, 1.5, -2.0, 40.25] {
        let (mut a, mut b) = (0.0f32, 0.0f32);
        unsafe {
            direct_entry(x, &mut a, std::ptr::null_mut());
            wrapped_entry(x, &mut b, std::ptr::null_mut());
        }
        assert_eq!(a, b);
    }
}

#[test]
fn diamond_topology_evaluates_each_unit_once() {
    let ctx = ShadingContext::new();
    let source = compile(&ctx, "source", "shader source(in float x, out float y){ y = x + 1.0; }");
    let double_it = compile(&ctx, "double_it", "shader double_it(in float x, out float y){ y = x * 2.0; }");
    let triple_it = compile(&ctx, "triple_it", "shader triple_it(in float x, out float y){ y = x * 3.0; }");
    let sum = compile(&ctx, "sum", "shader sum(in float a, in float b, out float y){ y = a + b; }");

    let mut group = ctx.create_shader_group_template("diamond");
    group.add_unit("source", &source).unwrap();
    group.add_unit("double_it", &double_it).unwrap();
    group.add_unit("triple_it", &triple_it).unwrap();
    group.add_unit("sum", &sum).unwrap();
    group.connect("source", "y", "double_it", "x");
    group.connect("source", "y", "triple_it", "x");
    group.connect("double_it", "y", "sum", "a");
    group.connect("triple_it", "y", "sum", "b");
    group.expose_input("source", "x", 0);
    group.expose_output("sum", "y", 1);
    group.set_root("sum");

    let instance = resolve_group(&ctx, &mut group);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut out = 0.0f32;
    unsafe { entry(1.0, &mut out, std::ptr::null_mut()) };
    // (1+1)*2 + (1+1)*3
    assert_eq!(out, 10.0);
}

#[test]
fn one_template_under_two_instance_names() {
    let ctx = ShadingContext::new();
    let double_it = compile(&ctx, "double_it", "shader double_it(in float x, out float y){ y = x * 2.0; }");

    let mut group = ctx.create_shader_group_template("chain");
    group.add_unit("d1", &double_it).unwrap();
    group.add_unit("d2", &double_it).unwrap();
    group.connect("d1", "y", "d2", "x");
    group.expose_input("d1", "x", 0);
    group.expose_output("d2", "y", 1);
    group.set_root("d2");

    let instance = resolve_group(&ctx, &mut group);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut out = 0.0f32;
    unsafe { entry(3.0, &mut out, std::ptr::null_mut()) };
    assert_eq!(out, 12.0);
}

#[test]
fn aggregate_wiring() {
    let ctx = ShadingContext::new();
    let make_color = compile(
        &ctx,
        "make_color",
        "shader make_color(in float s, out float3 c){ c = float3(s, s, s); }",
    );
    let brightness = compile(
        &ctx,
        "brightness",
        "shader brightness(in float3 c, out float o){ o = c.x + c.y + c.z; }",
    );

    let mut group = ctx.create_shader_group_template("colors");
    group.add_unit("make_color", &make_color).unwrap();
    group.add_unit("brightness", &brightness).unwrap();
    group.connect("make_color", "c", "brightness", "c");
    group.expose_input("make_color", "s", 0);
    group.expose_output("brightness", "o", 1);
    group.set_root("brightness");

    let instance = resolve_group(&ctx, &mut group);
    let entry: unsafe extern "C" fn(f32, *mut f32, Global) = unsafe { std::mem::transmute(instance.function_pointer()) };
    let mut out = 0.0f32;
    unsafe { entry(2.0, &mut out, std::ptr::null_mut()) };
    assert_eq!(out, 6.0);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Failure modes
////////////////////////////////////////////////////////////////////////////////////////////////////

#[test]
fn group_without_root() {
    let ctx = ShadingContext::new();
    let unit = compile(&ctx, "unit", "shader f(in float x, out float y){ y = x; }");
    let mut group = ctx.create_shader_group_template("rootless");
    group.add_unit("f", &unit).unwrap();
    assert!(matches!(
        ctx.resolve_shader_group(&mut group),
        Err(Error::ShaderGroupWithoutRoot)
    ));

    group.set_root("ghost");
    assert!(matches!(
        ctx.resolve_shader_group(&mut group),
        Err(Error::ShaderGroupWithoutRoot)
    ));
}

#[test]
fn empty_group_is_invalid_input() {
    let ctx = ShadingContext::new();
    let mut group = ctx.create_shader_group_template("empty");
    assert!(matches!(ctx.resolve_shader_group(&mut group), Err(Error::InvalidInput)));
}

#[test]
fn undefined_shader_unit() {
    let ctx = ShadingContext::new();
    let unit = compile(&ctx, "unit", "shader f(in float x, out float y){ y = x; }");
    let mut group = ctx.create_shader_group_template("dangling");
    group.add_unit("f", &unit).unwrap();
    group.connect("ghost", "y", "f", "x");
    group.expose_output("f", "y", 0);
    group.set_root("f");
    match ctx.resolve_shader_group(&mut group) {
        Err(Error::UndefinedShaderUnit(name)) => assert_eq!(name, "ghost"),
        other => panic!("expected UndefinedShaderUnit, got {:?}", other.err()),
    }
}

#[test]
fn argument_without_initialization() {
    let ctx = ShadingContext::new();
    let unit = compile(&ctx, "unit", "shader f(in float x, out float y){ y = x; }");
    let mut group = ctx.create_shader_group_template("uninit");
    group.add_unit("f", &unit).unwrap();
    group.expose_output("f", "y", 0);
    group.set_root("f");
    match ctx.resolve_shader_group(&mut group) {
        Err(Error::ArgumentWithoutInitialization {
            group: g,
            instance,
            argument,
        }) => {
            assert_eq!(g, "uninit");
            assert_eq!(instance, "f");
            assert_eq!(argument, "x");
        }
        other => panic!("expected ArgumentWithoutInitialization, got {:?}", other.err()),
    }
}

#[test]
fn connection_type_mismatch() {
    let ctx = ShadingContext::new();
    let int_out = compile(&ctx, "int_out", "shader g(out int y){ y = 1; }");
    let float_in = compile(&ctx, "float_in", "shader f(in float x, out float y){ y = x; }");
    let mut group = ctx.create_shader_group_template("mismatch");
    group.add_unit("g", &int_out).unwrap();
    group.add_unit("f", &float_in).unwrap();
    group.connect("g", "y", "f", "x");
    group.expose_output("f", "y", 0);
    group.set_root("f");
    assert!(matches!(ctx.resolve_shader_group(&mut group), Err(Error::InvalidArgType)));
}

#[test]
fn exposure_holes_are_rejected() {
    let ctx = ShadingContext::new();
    let unit = compile(&ctx, "unit", "shader f(in float x = 1.0, out float y){ y = x; }");
    let mut group = ctx.create_shader_group_template("holes");
    group.add_unit("f", &unit).unwrap();
    // index 0 is never assigned
    group.expose_output("f", "y", 1);
    group.set_root("f");
    assert!(matches!(
        ctx.resolve_shader_group(&mut group),
        Err(Error::InvalidShaderGroupTemplate)
    ));
}

#[test]
fn duplicate_instance_names_are_rejected() {
    let ctx = ShadingContext::new();
    let unit = compile(&ctx, "unit", "shader f(in float x, out float y){ y = x; }");
    let mut group = ctx.create_shader_group_template("dup");
    group.add_unit("f", &unit).unwrap();
    assert!(matches!(group.add_unit("f", &unit), Err(Error::InvalidInput)));
}
