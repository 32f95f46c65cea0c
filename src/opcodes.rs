/// Pickle protocol opcodes (protocol 0-2).
///
/// Protocol 0 is the text protocol: every argument is a printable,
/// newline-terminated line. Protocol 1 adds the counted binary forms,
/// protocol 2 the opcodes from 0x80 upward.

// -- Protocol 0 (text-based) --
pub const MARK: u8 = b'('; // push special markobject on stack
pub const STOP: u8 = b'.'; // every pickle ends with STOP
pub const POP: u8 = b'0'; // discard topmost stack item
pub const POP_MARK: u8 = b'1'; // discard stack top through topmost markobject
pub const DUP: u8 = b'2'; // duplicate top stack item
pub const FLOAT: u8 = b'F'; // push float; decimal string argument
pub const INT: u8 = b'I'; // push integer or bool; decimal string argument
pub const LONG: u8 = b'L'; // push long; decimal string argument
pub const NONE: u8 = b'N'; // push None
pub const PERSID: u8 = b'P'; // push persistent id; string argument
pub const REDUCE: u8 = b'R'; // apply callable to argtuple, both on stack
pub const STRING: u8 = b'S'; // push 8-bit string; repr-quoted argument
pub const UNICODE: u8 = b'V'; // push text string; raw-unicode-escaped argument
pub const APPEND: u8 = b'a'; // append stack top to list below it
pub const BUILD: u8 = b'b'; // apply state on stack top to object below it
pub const GLOBAL: u8 = b'c'; // push class/callable by module\nname\n
pub const DICT: u8 = b'd'; // build a dict from stack items
pub const APPENDS: u8 = b'e'; // extend list on stack by topmost stack slice
pub const GET: u8 = b'g'; // push item from memo by string index
pub const INST: u8 = b'i'; // build class instance; module\nname\n + marked args
pub const LIST: u8 = b'l'; // build list from topmost stack slice
pub const OBJ: u8 = b'o'; // build class instance; class sits just above the mark
pub const PUT: u8 = b'p'; // store stack top in memo by string index
pub const SETITEM: u8 = b's'; // add key+value pair to dict
pub const TUPLE: u8 = b't'; // build tuple from topmost stack slice
pub const SETITEMS: u8 = b'u'; // modify dict by adding topmost key+value pairs

// -- Protocol 1 (binary) --
pub const BINPERSID: u8 = b'Q'; // push persistent id from stack
pub const BININT: u8 = b'J'; // push 4-byte signed int
pub const BININT1: u8 = b'K'; // push 1-byte unsigned int
pub const BININT2: u8 = b'M'; // push 2-byte unsigned int
pub const BINSTRING: u8 = b'T'; // push 8-bit string; 4-byte counted
pub const SHORT_BINSTRING: u8 = b'U'; // push 8-bit string; 1-byte counted, < 256 bytes
pub const BINUNICODE: u8 = b'X'; // push text string; 4-byte counted UTF-8
pub const BINFLOAT: u8 = b'G'; // push float; 8-byte big-endian IEEE
pub const EMPTY_DICT: u8 = b'}'; // push empty dict
pub const EMPTY_LIST: u8 = b']'; // push empty list
pub const EMPTY_TUPLE: u8 = b')'; // push empty tuple
pub const BINGET: u8 = b'h'; // push item from memo by 1-byte index
pub const LONG_BINGET: u8 = b'j'; // push item from memo by 4-byte index
pub const BINPUT: u8 = b'q'; // store stack top in memo by 1-byte index
pub const LONG_BINPUT: u8 = b'r'; // store stack top in memo by 4-byte index

// -- Protocol 2 --
pub const PROTO: u8 = 0x80; // identify pickle protocol
pub const NEWOBJ: u8 = 0x81; // build object from class + argtuple on stack
pub const EXT1: u8 = 0x82; // push object from extension registry; 1-byte code
pub const EXT2: u8 = 0x83; // ditto, 2-byte code
pub const EXT4: u8 = 0x84; // ditto, 4-byte code
pub const TUPLE1: u8 = 0x85; // build 1-tuple from top of stack
pub const TUPLE2: u8 = 0x86; // build 2-tuple from top two stack items
pub const TUPLE3: u8 = 0x87; // build 3-tuple from top three stack items
pub const NEWTRUE: u8 = 0x88; // push True
pub const NEWFALSE: u8 = 0x89; // push False
pub const LONG1: u8 = 0x8a; // push long from < 256 bytes
pub const LONG4: u8 = 0x8b; // push really big long
