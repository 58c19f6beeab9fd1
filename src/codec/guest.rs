//! Guest-side half of the codec: a JavaScript module that speaks the same
//! wire format as [`super::encode`] / [`super::decode`].
//!
//! The tag constants are rendered from the Rust side so both halves can't
//! drift apart. The engine is not assumed to provide `TextEncoder`, so the
//! module carries its own UTF-8 conversion.

use super::envelope::{INVOCATION_GROUP, OP_ERROR, OP_VALUE};
use super::{ADDRESS_LENGTH, TAG_ADDRESS, TAG_BYTES, TAG_STRING, TAG_UINT32, TAG_UINT64};

/// Module id the capability and invocation modules import the codec from.
pub const MODULE_ID: &str = "arguments";

const BODY: &str = r#"
function utf8Encode(text) {
    const out = [];
    for (let i = 0; i < text.length; i++) {
        let code = text.charCodeAt(i);
        if (code >= 0xd800 && code <= 0xdbff && i + 1 < text.length) {
            const next = text.charCodeAt(i + 1);
            if (next >= 0xdc00 && next <= 0xdfff) {
                code = 0x10000 + ((code - 0xd800) << 10) + (next - 0xdc00);
                i++;
            }
        }
        if (code >= 0xd800 && code <= 0xdfff) {
            code = 0xfffd;
        }
        if (code < 0x80) {
            out.push(code);
        } else if (code < 0x800) {
            out.push(0xc0 | (code >> 6), 0x80 | (code & 0x3f));
        } else if (code < 0x10000) {
            out.push(0xe0 | (code >> 12), 0x80 | ((code >> 6) & 0x3f), 0x80 | (code & 0x3f));
        } else {
            out.push(
                0xf0 | (code >> 18),
                0x80 | ((code >> 12) & 0x3f),
                0x80 | ((code >> 6) & 0x3f),
                0x80 | (code & 0x3f),
            );
        }
    }
    return Uint8Array.from(out);
}

function utf8Decode(bytes) {
    let text = "";
    let i = 0;
    while (i < bytes.length) {
        const lead = bytes[i];
        let code;
        let extra;
        if (lead < 0x80) {
            code = lead;
            extra = 0;
        } else if ((lead & 0xe0) === 0xc0) {
            code = lead & 0x1f;
            extra = 1;
        } else if ((lead & 0xf0) === 0xe0) {
            code = lead & 0x0f;
            extra = 2;
        } else if ((lead & 0xf8) === 0xf0) {
            code = lead & 0x07;
            extra = 3;
        } else {
            throw new TypeError("invalid UTF-8 string");
        }
        for (let k = 1; k <= extra; k++) {
            const next = bytes[i + k];
            if (next === undefined || (next & 0xc0) !== 0x80) {
                throw new TypeError("invalid UTF-8 string");
            }
            code = (code << 6) | (next & 0x3f);
        }
        i += extra + 1;
        text += String.fromCodePoint(code);
    }
    return text;
}

export class Address {
    constructor(bytes) {
        if (!(bytes instanceof Uint8Array) || bytes.length !== ADDRESS_LENGTH) {
            throw new TypeError("address must be " + ADDRESS_LENGTH + " bytes");
        }
        this.bytes = bytes;
    }
}

export function argUint32(value) {
    if (!Number.isInteger(value) || value < 0 || value > 0xffffffff) {
        throw new RangeError("not a uint32: " + value);
    }
    return { type: TAG_UINT32, value };
}

export function argUint64(value) {
    const big = BigInt(value);
    if (big < 0n || big > 0xffffffffffffffffn) {
        throw new RangeError("not a uint64: " + value);
    }
    return { type: TAG_UINT64, value: big };
}

export function argString(value) {
    if (typeof value !== "string") {
        throw new TypeError("not a string: " + typeof value);
    }
    return { type: TAG_STRING, value };
}

export function argBytes(value) {
    if (!(value instanceof Uint8Array)) {
        throw new TypeError("not a Uint8Array: " + typeof value);
    }
    return { type: TAG_BYTES, value };
}

export function argAddress(value) {
    return { type: TAG_ADDRESS, value: value instanceof Address ? value : new Address(value) };
}

export function toArgument(value) {
    if (value instanceof Address) {
        return argAddress(value);
    }
    if (value instanceof Uint8Array) {
        return argBytes(value);
    }
    switch (typeof value) {
        case "number":
            return argUint32(value);
        case "bigint":
            return argUint64(value);
        case "string":
            return argString(value);
    }
    throw new TypeError("unsupported value type: " + typeof value);
}

function lengthPrefixed(payload) {
    const out = new Uint8Array(4 + payload.length);
    new DataView(out.buffer).setUint32(0, payload.length, true);
    out.set(payload, 4);
    return out;
}

function payloadOf(arg) {
    switch (arg.type) {
        case TAG_UINT32: {
            const out = new Uint8Array(4);
            new DataView(out.buffer).setUint32(0, arg.value, true);
            return out;
        }
        case TAG_UINT64: {
            const out = new Uint8Array(8);
            new DataView(out.buffer).setBigUint64(0, arg.value, true);
            return out;
        }
        case TAG_STRING:
            return lengthPrefixed(utf8Encode(arg.value));
        case TAG_BYTES:
            return lengthPrefixed(arg.value);
        case TAG_ADDRESS:
            return arg.value.bytes;
    }
    throw new TypeError("unknown argument type " + arg.type);
}

export function encode(args) {
    const parts = args.map((arg) => [arg.type, payloadOf(arg)]);
    const size = parts.reduce((total, [, payload]) => total + 4 + payload.length, 0);
    const out = new Uint8Array(size);
    const view = new DataView(out.buffer);
    let offset = 0;
    for (const [type, payload] of parts) {
        view.setUint32(offset, type, true);
        out.set(payload, offset + 4);
        offset += 4 + payload.length;
    }
    return out;
}

export function decode(bytes) {
    const view = new DataView(bytes.buffer, bytes.byteOffset, bytes.byteLength);
    const out = [];
    let offset = 0;
    const need = (n) => {
        if (offset + n > bytes.length) {
            throw new RangeError("truncated argument at offset " + offset);
        }
    };
    while (offset < bytes.length) {
        need(4);
        const type = view.getUint32(offset, true);
        offset += 4;
        switch (type) {
            case TAG_UINT32:
                need(4);
                out.push(argUint32(view.getUint32(offset, true)));
                offset += 4;
                break;
            case TAG_UINT64:
                need(8);
                out.push(argUint64(view.getBigUint64(offset, true)));
                offset += 8;
                break;
            case TAG_STRING:
            case TAG_BYTES: {
                need(4);
                const length = view.getUint32(offset, true);
                offset += 4;
                need(length);
                const raw = bytes.slice(offset, offset + length);
                offset += length;
                out.push(type === TAG_STRING ? argString(utf8Decode(raw)) : argBytes(raw));
                break;
            }
            case TAG_ADDRESS:
                need(ADDRESS_LENGTH);
                out.push(argAddress(bytes.slice(offset, offset + ADDRESS_LENGTH)));
                offset += ADDRESS_LENGTH;
                break;
            default:
                throw new TypeError("unknown argument type " + type);
        }
    }
    return out;
}

export function encodeEnvelope(group, op, args) {
    const body = encode(args);
    const out = new Uint8Array(8 + body.length);
    const view = new DataView(out.buffer);
    view.setUint32(0, group, true);
    view.setUint32(4, op, true);
    out.set(body, 8);
    return out;
}

export function decodeEnvelope(bytes) {
    if (bytes.length < 8) {
        throw new RangeError("envelope shorter than its 8-byte header");
    }
    const view = new DataView(bytes.buffer, bytes.byteOffset, bytes.byteLength);
    return {
        group: view.getUint32(0, true),
        op: view.getUint32(4, true),
        args: decode(bytes.subarray(8)),
    };
}
"#;

/// Renders the codec module source.
pub fn codec_module() -> String {
    let header = format!(
        "const TAG_UINT32 = {TAG_UINT32};\n\
         const TAG_UINT64 = {TAG_UINT64};\n\
         const TAG_STRING = {TAG_STRING};\n\
         const TAG_BYTES = {TAG_BYTES};\n\
         const TAG_ADDRESS = {TAG_ADDRESS};\n\
         const ADDRESS_LENGTH = {ADDRESS_LENGTH};\n\
         export const INVOCATION_GROUP = {INVOCATION_GROUP};\n\
         export const OP_VALUE = {OP_VALUE};\n\
         export const OP_ERROR = {OP_ERROR};\n"
    );
    header + BODY
}
