/*!

# Node to Gateway Transport

DON member nodes dial out to the Gateway over websockets. The Gateway never dials a node.
Every session starts with a two step handshake that proves the node is a member of the DON
it claims to serve.

## Handshake

The upgrade request carries an `Authorization` header holding the hex encoded auth header:

```bytes
0-3       timestamp (big-endian u32, unix seconds)
4-67      DON ID (zero padded)
68-131    Gateway ID (zero padded)
132-196   65 byte recoverable signature over bytes 0-131
```

The Gateway checks the Gateway ID, the timestamp window and that the recovered signer is a
member of the DON. It then answers the upgrade with a `Challenge` header:

```bytes
0-3       timestamp (big-endian u32, unix seconds)
4-67      Gateway ID (zero padded)
68..      random nonce
```

The node checks the nonce length, the Gateway ID against the URL it dialed and the timestamp,
and writes its signature over the whole challenge as the first binary frame. The Gateway accepts
the session only if the challenge was signed by the same member that signed the auth header.

## Sessions

After the handshake every frame is a binary JSON-RPC object (see [`crate::api`]). A node keeps
one [`connection::ConnectionWrapper`] per Gateway; the session inside it is swapped on every
reconnect and redials are spaced out by [`backoff::RedialBackoff`].

*/

pub mod backoff;
pub mod client;
pub mod connection;
pub mod handshake;
