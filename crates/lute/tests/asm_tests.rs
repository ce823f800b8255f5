use num_bigint::BigInt;
use pretty_assertions::assert_eq;

use lute::{assemble, disassemble, Constant};

#[test]
fn minimal_program() {
    let p = assemble("program:\n function: Top 0 0 0\n  code:\n").unwrap();
    assert_eq!(p.functions.len(), 1);
    assert_eq!(p.toplevel().name, "Top");
    assert!(p.toplevel().code.is_empty());
    assert!(!p.recursion);
}

#[test]
fn recursion_flag() {
    let p = assemble("program: +recursion\n function: top 0 0 0\n  code:\n").unwrap();
    assert!(p.recursion);
    let err = assemble("program: +warp\n function: top 0 0 0\n  code:\n").unwrap_err();
    assert!(err.to_string().contains("program"));
    assert!(err.to_string().contains("unknown flag"));
}

#[test]
fn comments_and_blank_lines_ignored() {
    let p = assemble(
        r#"
# leading comment
program:    # trailing comment

  constants:
    string "has # inside"   # real comment
  function: top 2 0 0
    code:
      constant 0  # push it
      return
"#,
    )
    .unwrap();
    assert_eq!(p.constants, vec![Constant::Str("has # inside".to_string())]);
}

#[test]
fn all_constant_kinds() {
    let p = assemble(
        r#"
program:
  constants:
    int -42
    bigint 123456789012345678901234567890
    float 2.5
    float 1e300
    string "a\nb\t\"c\"\\"
    bytes "\x00\xff ok"
  function: top 1 0 0
    code:
      none
      return
"#,
    )
    .unwrap();
    assert_eq!(p.constants[0], Constant::Int(-42));
    assert_eq!(
        p.constants[1],
        Constant::BigInt("123456789012345678901234567890".parse::<BigInt>().unwrap())
    );
    assert_eq!(p.constants[2], Constant::Float(2.5));
    assert_eq!(p.constants[3], Constant::Float(1e300));
    assert_eq!(p.constants[4], Constant::Str("a\nb\t\"c\"\\".to_string()));
    assert_eq!(
        p.constants[5],
        Constant::Bytes(vec![0x00, 0xff, b' ', b'o', b'k'])
    );
}

#[test]
fn invalid_escape_rejected() {
    let err = assemble(
        "program:\n constants:\n  string \"\\q\"\n function: top 0 0 0\n  code:\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("constants"));
    assert!(err.to_string().contains("escape"));
}

#[test]
fn int_literal_must_fit_machine_word() {
    let err = assemble(
        "program:\n constants:\n  int 99999999999999999999\n function: top 0 0 0\n  code:\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("invalid int literal"));
}

#[test]
fn argument_presence_is_checked() {
    let err =
        assemble("program:\n function: top 1 0 0\n  code:\n   jmp\n").unwrap_err();
    assert!(err.to_string().contains("requires an argument"));
    let err =
        assemble("program:\n function: top 1 0 0\n  code:\n   nop 3\n").unwrap_err();
    assert!(err.to_string().contains("takes no argument"));
    let err =
        assemble("program:\n function: top 1 0 0\n  code:\n   frobnicate\n").unwrap_err();
    assert!(err.to_string().contains("unknown opcode"));
}

#[test]
fn jump_must_land_on_instruction_boundary() {
    // jmp 1 lands inside the jmp's own varint argument.
    let err = assemble(
        "program:\n function: top 1 0 0\n  code:\n   jmp 1\n   none\n   return\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("boundary"));
}

#[test]
fn cells_must_name_locals() {
    let err = assemble(
        "program:\n function: top 1 0 0\n  locals:\n   x\n  cells:\n   y\n  code:\n   none\n   return\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("cells"));
    assert!(err.to_string().contains("does not name a local"));

    let p = assemble(
        "program:\n function: top 1 0 0\n  locals:\n   x\n   y\n  cells:\n   y\n  code:\n   none\n   return\n",
    )
    .unwrap();
    assert_eq!(p.toplevel().cells, vec![1]);
}

#[test]
fn code_section_is_required() {
    let err = assemble("program:\n function: top 1 0 0\n").unwrap_err();
    assert!(err.to_string().contains("no code: section"));
}

#[test]
fn at_least_one_function_required() {
    let err = assemble("program:\n").unwrap_err();
    assert!(err.to_string().contains("at least one function"));
}

#[test]
fn descriptor_validation() {
    // pc0 must be < pc1.
    let err = assemble(
        "program:\n function: top 1 0 0\n  defers:\n   2 1 0\n  code:\n   none\n   nop\n   return\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("malformed"));

    // start_pc inside its own covered range.
    let err = assemble(
        "program:\n function: top 1 0 0\n  defers:\n   0 2 1\n  code:\n   none\n   nop\n   return\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("own covered range"));
}

#[test]
fn function_header_flags() {
    let p = assemble(
        "program:\n function: f 4 2 1 +varargs +kwargs\n  locals:\n   a\n   b\n   args\n   kw\n  code:\n   none\n   return\n",
    )
    .unwrap();
    let f = p.toplevel();
    assert_eq!(f.max_stack, 4);
    assert_eq!(f.num_params, 2);
    assert_eq!(f.num_kwonly_params, 1);
    assert!(f.has_varargs);
    assert!(f.has_kwargs);
}

const ROUND_TRIP: &str = r#"
program: +recursion
  loads:
    helpers
  names:
    len
    field
  globals:
    result
  constants:
    int 7
    bigint -99999999999999999999999999
    float 0.5
    string "hi\n"
    bytes "\x01\x02"
  function: top 8 0 0
    locals:
      i
      acc
    cells:
      acc
    catches:
      0 10 18
    defers:
      0 10 22
    code:
      constant 0      # 0
      setlocal 0      # 2
      none            # 4
      rundefer        # 5
      jmp 10          # 6
      nop             # 8
      nop             # 9
      return          # 10
      nop             # 11
      nop             # 12
      nop             # 13
      nop             # 14
      nop             # 15
      nop             # 16
      nop             # 17
      none            # 18  catch body
      catchjmp 0      # 19
      nop             # 21
      deferexit       # 22  defer body
  function: helper 2 1 0 +varargs
    locals:
      x
      rest
    freevars:
      acc
    code:
      freecell 0
      return
"#;

#[test]
fn assemble_disassemble_round_trip() {
    let p1 = assemble(ROUND_TRIP).unwrap();
    let text = disassemble(&p1).unwrap();
    let p2 = assemble(&text).unwrap();
    assert_eq!(p1, p2);
    assert_eq!(text, disassemble(&p2).unwrap());
}

#[test]
fn disassembly_lists_descriptors_and_args() {
    let p = assemble(ROUND_TRIP).unwrap();
    let text = disassemble(&p).unwrap();
    assert!(text.contains("program: +recursion"));
    assert!(text.contains("0 10 18"));
    assert!(text.contains("0 10 22"));
    assert!(text.contains("jmp 10"));
    assert!(text.contains("bigint -99999999999999999999999999"));
    assert!(text.contains("string \"hi\\n\""));
    assert!(text.contains("bytes \"\\x01\\x02\""));
    assert!(text.contains("function: helper 2 1 0 +varargs"));
}

#[test]
fn sections_out_of_order_rejected() {
    let err = assemble(
        "program:\n globals:\n  g\n names:\n  n\n function: top 0 0 0\n  code:\n",
    )
    .unwrap_err();
    assert!(err.to_string().contains("unexpected line"));
}
