/*

Packtun relays TCP and UDP traffic between a near host, where connections are intercepted, and a
far host, where they leave for their destination.

# Pack channel (tun / tund)

Every destination gets a channel: a pair of UDP sockets exchanging packs. A pack is

  pack_id:u32 | stream_id:u64 | payload

where pack_id counts from 1 within its stream. A pack_id of 0 marks a control datagram instead:

  0:u32 | type:u8 | body

Each stream numbers its own packs. The receiver confirms every pack it sees, delivers in order, and
keeps out-of-order packs until the gap fills. The sender keeps every unconfirmed pack and resends it
once per resend interval. A pack still unconfirmed after the resend limit ends the whole channel,
since at that point the peer is either gone or the path is unusable.

Packs are not resent only on timeout. Once per status interval the sender reports, for each stream,
the biggest pack id sent and confirmed. The receiver answers with the ranges it is missing, and the
sender resends those ranges right away unless they were sent very recently.

  near                                   far
   |  data 1..n                           |
   | -----------------------------------> |
   |                        confirm k     |
   | <----------------------------------- |
   |  status(biggest_sent)                |
   | -----------------------------------> |
   |                  miss_range(a, b)    |
   | <----------------------------------- |

The first pack of a stream has its payload passed through the obfuscator, which hides the
recognizable opening bytes of common protocols.

# Closing a stream

Either side closes its sending half with a FIN carrying the id of its last pack. The receiver only
acknowledges the FIN once every pack up to that id has been delivered, so an acknowledged FIN means
no data is in flight in that direction. The near side sends FIN1 and receives GOT_FIN1; the far side
sends FIN2 and receives GOT_FIN2. The stream is removed once both halves are closed, and its id is
remembered for a while so that late datagrams do not recreate it.

# Tunnel setup

The near side opens a UDP socket for a destination and sends an apply-for-tunnel request to the far
control port. The far side creates a socket for it and announces its port; from then on the near
side only talks to that port, and the far side only accepts datagrams from the address that first
reached it.

# UDP relay (udp / udpd)

Redirected datagrams lose their destination, which is recovered from the kernel's connection
tracking table. Each flow gets a relay socket on the near side and a room on a far binding shared by
every flow of the same source. The far binding also accepts datagrams from peers that have not been
applied for yet, holding them until the near side claims them.

# Multiplexed relay (proxy / proxyd)

Streams can also share one TCP link. Messages are

  length:u16 | type:u8 | body

with one type per event (new source, traffic, close in either direction, overflow, underhalf, name
query and response, heartbeat). Write queues spill to disk past a chunk size, and a queue above the
overflow mark asks the peer to stop reading the matching socket until it drains below half.

*/

pub mod channel;
pub mod cli;
pub mod config;
pub mod conn;
pub mod epoch;
pub mod error;
pub mod frame;
pub mod mac;
pub mod mux;
pub mod nat;
pub mod obfs;
pub mod proxy;
pub mod proxyd;
pub mod reactor;
pub mod registry;
pub mod socket;
pub mod spill;
pub mod tun;
pub mod tund;
pub mod tunnel;
pub mod udp;
pub mod udpd;

pub use error::{Error, Result};
