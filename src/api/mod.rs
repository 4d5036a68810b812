/*!

# Gateway Wire Format

Every frame exchanged between a Gateway and a DON node, and between a user and the Gateway,
is a JSON-RPC 2.0 object.

## User traffic

Users send a plain request and receive a plain response or error:

```json
{"jsonrpc": "2.0", "id": "42", "method": "vault.secrets_get", "params": {...}}
{"jsonrpc": "2.0", "id": "42", "result": {...}}
{"jsonrpc": "2.0", "id": "42", "error": {"code": -32000, "message": "request expired"}}
```

## Node traffic

Gateway and node wrap a [`message::Message`] in the envelope: a request (gateway to node)
carries it in `params`, a response (node to gateway) carries it in `result`.

```json
{
  "jsonrpc": "2.0", "id": "42", "method": "vault.secrets_get",
  "result": {
    "body": {"message_id": "42", "method": "vault.secrets_get", "don_id": "don_1",
             "payload": {...}, "sender": "0x02..."},
    "signature": "0x..."
  }
}
```

Only `body` is signed. The signed bytes are described in [`message::MessageBody::signing_bytes`].

*/

pub mod codec;
pub mod jsonrpc;
pub mod message;
