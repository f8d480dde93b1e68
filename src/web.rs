use colored::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::error::Result;
use crate::models::{Clip, Counts, DuelRoute, Message, Side, Stream};
use crate::player::embed_url;
use crate::reactions::fetch_counts;
use crate::store::DataService;

/// Everything a connection handler needs. Built once by the binary.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn DataService>,
    pub config: Arc<Config>,
}

/// Embedded lobby page: stream cards, pick two, open the duel.
pub const LOBBY_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Duel Arena · Lobby</title>
<style>
body{margin:0;padding:2rem;background:#09090b;color:#fafafa;font-family:system-ui,sans-serif}
h1{margin:0 0 1.5rem}
#grid{display:grid;grid-template-columns:repeat(auto-fill,minmax(240px,1fr));gap:1rem}
.card{padding:1rem;border-radius:12px;border:1px solid #27272a;background:#18181b;cursor:pointer}
.card.sel{border-color:#3b82f6;background:#27272a}
.card small{color:#a1a1aa;display:block;margin:.25rem 0 .5rem}
.live{color:#f87171;font-size:.75rem;margin-left:.5rem}
a{color:#60a5fa}
#go{display:none;margin:2rem auto 0;padding:.75rem 1.5rem;border:0;border-radius:8px;background:#2563eb;color:#fff;font-weight:600;cursor:pointer}
#err{color:#f87171}
</style>
</head>
<body>
<h1>Lobby</h1>
<p id="err"></p>
<div id="grid"></div>
<button id="go">Watch duel</button>
<script>
const MAX=2;let selected=[];
const grid=document.getElementById('grid'),go=document.getElementById('go');
function toggle(id){
  const i=selected.indexOf(id);
  if(i>=0)selected.splice(i,1);else if(selected.length<MAX)selected.push(id);
  render();
}
let streams=[];
function render(){
  grid.innerHTML='';
  for(const s of streams){
    const d=document.createElement('div');
    d.className='card'+(selected.includes(s.id)?' sel':'');
    d.onclick=()=>toggle(s.id);
    const h=document.createElement('strong');h.textContent=s.title;d.appendChild(h);
    if(s.is_live){const l=document.createElement('span');l.className='live';l.textContent='LIVE';d.appendChild(l);}
    const p=document.createElement('small');p.textContent='Platform: '+s.platform;d.appendChild(p);
    const a=document.createElement('a');a.href=s.url;a.target='_blank';a.textContent='Open channel';
    a.onclick=e=>e.stopPropagation();d.appendChild(a);
    grid.appendChild(d);
  }
  go.style.display=selected.length===MAX?'block':'none';
}
go.onclick=()=>{location.href='/duel?s1='+encodeURIComponent(selected[0])+'&s2='+encodeURIComponent(selected[1]);};
fetch('/api/streams').then(r=>r.json()).then(j=>{
  if(j.error){document.getElementById('err').textContent=j.error;return;}
  streams=j.data||[];render();
}).catch(e=>console.error(e));
</script>
</body>
</html>"##;

/// Embedded duel page: two players, counters, chat, clips. All writes go
/// through the websocket session.
pub const DUEL_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Duel Arena · Duel</title>
<style>
body{margin:0;padding:1.5rem;background:#09090b;color:#fafafa;font-family:system-ui,sans-serif}
header{display:flex;justify-content:space-between;align-items:center;margin-bottom:1rem}
button{background:#27272a;color:#fafafa;border:0;border-radius:8px;padding:.4rem .8rem;cursor:pointer}
.grid{display:grid;grid-template-columns:1fr 1fr;gap:1rem}
.side{background:#18181b;border:1px solid #27272a;border-radius:12px;overflow:hidden}
.video{aspect-ratio:16/9;background:#000;display:flex;align-items:center;justify-content:center}
.video iframe{width:100%;height:100%;border:0}
.panel{padding:.75rem;display:flex;flex-direction:column;gap:.5rem}
.counts{display:flex;gap:1.5rem;font-size:1.25rem;font-weight:600}
.like{color:#4ade80}.dislike{color:#f87171}
.hl{transform:scale(1.15);transition:transform .3s}
#chat{background:#18181b;border:1px solid #27272a;border-radius:12px;margin-top:1rem;padding:.75rem}
#log{height:14rem;overflow-y:auto;background:#27272a;border-radius:8px;padding:.5rem;font-size:.9rem}
#log .u{color:#60a5fa}
#form{display:flex;gap:.5rem;margin-top:.5rem}
#form input{flex:1;background:#3f3f46;color:#fff;border:0;border-radius:8px;padding:.5rem}
#notice{color:#facc15;min-height:1.2rem}
#clips{font-size:.85rem;color:#a1a1aa}
</style>
</head>
<body>
<header><h1 id="title">Duel</h1><button onclick="location.href='/'">Back to lobby</button></header>
<div id="notice"></div>
<div class="grid">
  <div class="side" id="side-left"></div>
  <div class="side" id="side-right"></div>
</div>
<div style="margin-top:.75rem;display:flex;gap:.5rem;flex-wrap:wrap">
  <button data-preset="mute_both">Mute both</button>
  <button data-preset="solo_left">Left only</button>
  <button data-preset="solo_right">Right only</button>
  <button data-preset="unmute_both">Unmute both</button>
</div>
<div id="chat">
  <strong>Crowd chat</strong>
  <div id="log"></div>
  <form id="form"><input id="msg" placeholder="Type a message..." autocomplete="off"><button>Send</button></form>
</div>
<div id="clips"></div>
<script>
const q=new URLSearchParams(location.search);
const s1=q.get('s1')||'',s2=q.get('s2')||'';
const SIDES=['left','right'];
const store={get:k=>localStorage.getItem(k)||'',set:(k,v)=>localStorage.setItem(k,v)};
let ws,highlightMs=400,seen=new Set();
function notice(t){const n=document.getElementById('notice');n.textContent=t;setTimeout(()=>{if(n.textContent===t)n.textContent='';},2500);}
function send(o){if(ws&&ws.readyState===1)ws.send(JSON.stringify(o));}
function buildSide(side,card){
  const root=document.getElementById('side-'+side);
  const v=document.createElement('div');v.className='video';
  if(card&&card.embed_url){
    const f=document.createElement('iframe');f.id='player-'+side;f.src=card.embed_url;f.allowFullscreen=true;
    v.appendChild(f);
  }else{v.textContent=card?card.title:'Unknown stream';}
  root.appendChild(v);
  const p=document.createElement('div');p.className='panel';
  p.innerHTML='<div class="counts"><span class="like" id="like-'+side+'">👍 0</span><span class="dislike" id="dislike-'+side+'">👎 0</span></div>'+
   '<div><button data-r="like">👍 Like</button> <button data-r="dislike">👎 Dislike</button> <button data-clip>🎬 Clip</button></div>'+
   '<div><button data-mute>Mute</button> <button data-unmute>Unmute</button> <input type="range" min="0" max="100" value="50" data-vol></div>';
  p.querySelectorAll('[data-r]').forEach(b=>b.onclick=()=>send({type:'react',side,rtype:b.dataset.r}));
  p.querySelector('[data-clip]').onclick=()=>send({type:'clip',side});
  p.querySelector('[data-mute]').onclick=()=>send({type:'mute',side});
  p.querySelector('[data-unmute]').onclick=()=>send({type:'unmute',side});
  p.querySelector('[data-vol]').oninput=e=>send({type:'volume',side,value:Number(e.target.value)});
  root.appendChild(p);
}
function setCounts(c){
  for(const k of ['like','dislike']){
    const el=document.getElementById(k+'-'+c.side);if(!el)continue;
    el.textContent=(k==='like'?'👍 ':'👎 ')+c[k];
    if(c.highlight===k){el.classList.add('hl');setTimeout(()=>el.classList.remove('hl'),highlightMs);}
  }
}
function addMessage(m){
  if(seen.has(m.id))return;seen.add(m.id);
  const log=document.getElementById('log');const p=document.createElement('p');p.style.margin='.2rem 0';
  const u=document.createElement('span');u.className='u';u.textContent=m.username+': ';p.appendChild(u);
  p.appendChild(document.createTextNode(m.content));log.appendChild(p);log.scrollTop=log.scrollHeight;
}
function addClip(c){const d=document.createElement('div');d.textContent='🎬 '+c.side+' · '+c.title+' @ '+new Date(c.ts_seconds*1000).toLocaleTimeString();document.getElementById('clips').appendChild(d);}
function playerCommand(m){
  const f=document.getElementById('player-'+m.side);if(!f||!f.contentWindow)return;
  const call=(func,args)=>f.contentWindow.postMessage(JSON.stringify({event:'command',func,args:args||[]}),'*');
  if(m.cmd==='mute')call('mute');else if(m.cmd==='unmute')call('unMute');else if(m.cmd==='volume')call('setVolume',[m.volume]);
}
function connect(){
  const url=(location.protocol==='https:'?'wss://':'ws://')+location.host+'/ws/duel?s1='+encodeURIComponent(s1)+'&s2='+encodeURIComponent(s2)+
    '&fp='+encodeURIComponent(store.get('user_fingerprint'))+'&user='+encodeURIComponent(store.get('chat_username'));
  ws=new WebSocket(url);
  ws.onmessage=ev=>{
    const m=JSON.parse(ev.data);
    switch(m.type){
      case 'welcome':
        store.set('user_fingerprint',m.fingerprint);store.set('chat_username',m.username);highlightMs=m.highlight_ms;
        for(const s of SIDES)if(document.getElementById('player-'+s))send({type:'player_ready',side:s});
        for(const s of SIDES)setCounts({side:s,like:m.snapshot[s].like,dislike:m.snapshot[s].dislike});
        m.snapshot.messages.forEach(addMessage);m.snapshot.clips.forEach(addClip);break;
      case 'counts':setCounts(m);break;
      case 'chat':addMessage(m.message);break;
      case 'clip':addClip(m.clip);break;
      case 'notice':notice(m.message);break;
      case 'player':playerCommand(m);break;
      case 'error':notice(m.message);break;
    }
  };
  ws.onclose=()=>notice('Disconnected');
}
document.querySelectorAll('[data-preset]').forEach(b=>b.onclick=()=>send({type:'preset',name:b.dataset.preset}));
document.getElementById('form').onsubmit=e=>{
  e.preventDefault();const i=document.getElementById('msg');
  if(!i.value.trim())return;send({type:'chat',text:i.value});i.value='';
};
fetch('/api/duel?s1='+encodeURIComponent(s1)+'&s2='+encodeURIComponent(s2)).then(r=>r.json()).then(d=>{
  if(d.error){notice(d.error);return;}
  document.getElementById('title').textContent=(d.left?d.left.title:s1)+' vs '+(d.right?d.right.title:s2);
  buildSide('left',d.left);buildSide('right',d.right);connect();
}).catch(e=>console.error(e));
</script>
</body>
</html>"##;

// ---------------------------------------------------------------------------
// Query strings
// ---------------------------------------------------------------------------

/// Percent-decoding for URL query parameters.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("0");
                out.push(u8::from_str_radix(hex, 16).unwrap_or(b'?'));
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Percent-encode everything outside the unreserved set.
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Parse query string into key-value pairs.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

fn split_target(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(idx) => (&target[..idx], &target[idx + 1..]),
        None => (target, ""),
    }
}

// ---------------------------------------------------------------------------
// Request head
// ---------------------------------------------------------------------------

/// The parts of an HTTP request head the router cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub host: Option<String>,
    pub websocket: bool,
}

/// Largest request head accepted, websocket handshakes included.
pub const MAX_HEAD_BYTES: usize = 8192;
const MAX_HEADERS: usize = 64;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Outcome of parsing the bytes received so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadParse {
    Complete(RequestHead),
    /// More bytes are needed.
    Partial,
    Invalid(String),
}

pub fn parse_request_head(buf: &[u8]) -> HeadParse {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return HeadParse::Partial,
        Err(e) => return HeadParse::Invalid(e.to_string()),
    }
    let mut host = None;
    let mut websocket = false;
    for h in req.headers.iter() {
        let value = String::from_utf8_lossy(h.value);
        if h.name.eq_ignore_ascii_case("host") {
            host = Some(value.trim().to_string());
        } else if h.name.eq_ignore_ascii_case("upgrade") && value.trim().eq_ignore_ascii_case("websocket") {
            websocket = true;
        }
    }
    match (req.method, req.path) {
        (Some(method), Some(path)) => HeadParse::Complete(RequestHead {
            method: method.to_string(),
            target: path.to_string(),
            host,
            websocket,
        }),
        _ => HeadParse::Invalid("missing request line".to_string()),
    }
}

/// Host name without port, as Twitch embeds expect it.
fn parent_host(host: Option<&str>) -> String {
    host.and_then(|h| h.split(':').next())
        .filter(|h| !h.is_empty())
        .unwrap_or("localhost")
        .to_string()
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    fn html(body: &str) -> Self {
        HttpResponse {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.to_string(),
        }
    }

    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        let body = serde_json::to_string(value)
            .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string());
        HttpResponse {
            status,
            content_type: "application/json",
            body,
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            _ => "Internal Server Error",
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

/// A stream as shown on the duel page.
#[derive(Debug, Serialize)]
struct StreamCard {
    #[serde(flatten)]
    stream: Stream,
    embed_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct SideCounts {
    left: Counts,
    right: Counts,
}

#[derive(Debug, Serialize)]
struct DuelSummary {
    duel_id: String,
    left: Option<StreamCard>,
    right: Option<StreamCard>,
    counts: SideCounts,
    messages: Vec<Message>,
    clips: Vec<Clip>,
}

fn duel_summary(service: &dyn DataService, route: &DuelRoute, parent: &str) -> Result<DuelSummary> {
    let card = |id: &str| -> Result<Option<StreamCard>> {
        Ok(service.get_stream(id)?.map(|stream| StreamCard {
            embed_url: embed_url(&stream, parent),
            stream,
        }))
    };
    let duel_id = route.duel_id();
    Ok(DuelSummary {
        left: card(&route.left)?,
        right: card(&route.right)?,
        counts: SideCounts {
            left: fetch_counts(service, &duel_id, Side::Left)?,
            right: fetch_counts(service, &duel_id, Side::Right)?,
        },
        messages: service.select_messages(&duel_id)?,
        clips: service.select_clips(&duel_id)?,
        duel_id,
    })
}

/// Plain HTTP routing. Websocket upgrades never reach this.
pub fn route_request(state: &AppState, head: &RequestHead) -> HttpResponse {
    if head.method != "GET" {
        return HttpResponse::error(405, "only GET is supported");
    }
    let (path, query) = split_target(&head.target);
    match path {
        "/" => HttpResponse::html(LOBBY_HTML),
        "/duel" => match DuelRoute::from_query(&parse_query(query)) {
            Ok(_) => HttpResponse::html(DUEL_HTML),
            Err(e) => HttpResponse::error(400, &e.to_string()),
        },
        "/api/streams" => match state.service.list_streams() {
            Ok(data) => HttpResponse::json(200, &serde_json::json!({ "data": data })),
            Err(e) => {
                tracing::error!(error = %e, "stream list failed");
                HttpResponse::error(500, &e.to_string())
            }
        },
        "/api/duel" => {
            let route = match DuelRoute::from_query(&parse_query(query)) {
                Ok(r) => r,
                Err(e) => return HttpResponse::error(400, &e.to_string()),
            };
            let parent = parent_host(head.host.as_deref());
            match duel_summary(state.service.as_ref(), &route, &parent) {
                Ok(summary) => HttpResponse::json(200, &summary),
                Err(e) => {
                    tracing::error!(duel_id = %route.duel_id(), error = %e, "duel summary failed");
                    HttpResponse::error(500, &e.to_string())
                }
            }
        }
        _ => HttpResponse::error(404, "not found"),
    }
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.bind, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    eprintln!(
        "{}",
        format!("  Duel Arena running at http://{}", listener.local_addr()?).bright_green()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    serve_on(listener, state).await
}

/// Accept loop on an already-bound listener.
pub async fn serve_on(listener: TcpListener, state: AppState) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                tracing::warn!(%peer, error = %e, "connection error");
            }
        });
    }
}

/// Peek until the whole request head is buffered, leaving it unread so a
/// websocket handshake stays intact for tungstenite. `Err` carries the 400
/// reason; `Ok(None)` means the peer went away.
async fn peek_head(stream: &TcpStream) -> Result<std::result::Result<Option<RequestHead>, String>> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Ok(None));
        }
        match parse_request_head(&buf[..n]) {
            HeadParse::Complete(head) => return Ok(Ok(Some(head))),
            HeadParse::Invalid(reason) => return Ok(Err(reason)),
            HeadParse::Partial if n == buf.len() => {
                return Ok(Err("request head too large".to_string()))
            }
            HeadParse::Partial => {
                // peek returns at once while bytes are queued; wait for more.
                if n == seen {
                    tokio::time::sleep(PEEK_RETRY).await;
                }
                seen = n;
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: AppState) -> Result<()> {
    let head = match tokio::time::timeout(HEAD_TIMEOUT, peek_head(&stream)).await {
        Ok(Ok(Ok(Some(head)))) => head,
        Ok(Ok(Ok(None))) => return Ok(()),
        Ok(Ok(Err(reason))) => {
            stream.write_all(&HttpResponse::error(400, &reason).to_bytes()).await?;
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            tracing::debug!("request head timed out");
            return Ok(());
        }
    };

    if head.websocket {
        let (path, query) = split_target(&head.target);
        if path == "/ws/duel" {
            let params = parse_query(query);
            let route = match DuelRoute::from_query(&params) {
                Ok(r) => r,
                Err(e) => {
                    stream.write_all(&HttpResponse::error(400, &e.to_string()).to_bytes()).await?;
                    return Ok(());
                }
            };
            let ws = tokio_tungstenite::accept_async(stream).await?;
            crate::session::handle_ws(ws, state, route, params).await;
            return Ok(());
        }
    }

    // Plain GET: the head is all there is, so draining it is enough.
    let mut sink = vec![0u8; MAX_HEAD_BYTES];
    let _ = stream.read(&mut sink).await?;

    let response = route_request(&state, &head);
    tracing::debug!(method = %head.method, target = %head.target, status = response.status, "http");
    stream.write_all(&response.to_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewMessage, NewReaction, ReactionKind};
    use crate::realtime::ChangeFeed;
    use crate::store::SqliteService;
    use crate::store::testing::FlakyService;

    fn state_with(service: Arc<dyn DataService>) -> AppState {
        AppState {
            service,
            config: Arc::new(Config::default()),
        }
    }

    fn state() -> AppState {
        state_with(Arc::new(SqliteService::in_memory(ChangeFeed::default()).unwrap()))
    }

    fn get(target: &str) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            target: target.to_string(),
            host: Some("example.org:8890".to_string()),
            websocket: false,
        }
    }

    fn body_json(resp: &HttpResponse) -> serde_json::Value {
        serde_json::from_str(&resp.body).unwrap()
    }

    // -- url helpers --

    #[test]
    fn test_url_decode_basic() {
        assert_eq!(url_decode("hello+world"), "hello world");
        assert_eq!(url_decode("hello%20world"), "hello world");
        assert_eq!(url_decode("a%26b"), "a&b");
        assert_eq!(url_decode("plain"), "plain");
    }

    #[test]
    fn test_url_decode_multibyte() {
        assert_eq!(url_decode("%C3%A9quipe"), "équipe");
    }

    #[test]
    fn test_url_decode_bad_escape_kept() {
        assert_eq!(url_decode("100%zz"), "100%zz");
        assert_eq!(url_decode("tail%"), "tail%");
    }

    #[test]
    fn test_url_encode_reserved() {
        assert_eq!(url_encode("a b&c=d"), "a%20b%26c%3Dd");
        assert_eq!(url_encode("safe-_.~"), "safe-_.~");
        assert_eq!(url_decode(&url_encode("é ü")), "é ü");
    }

    #[test]
    fn test_parse_query_basic() {
        let q = parse_query("s1=a&s2=b%20c&flag");
        assert_eq!(q.get("s1").unwrap(), "a");
        assert_eq!(q.get("s2").unwrap(), "b c");
        assert_eq!(q.get("flag").unwrap(), "");
    }

    #[test]
    fn test_parse_query_empty() {
        assert!(parse_query("").is_empty());
    }

    // -- request head --

    #[test]
    fn test_parse_request_head_plain_get() {
        let HeadParse::Complete(head) =
            parse_request_head(b"GET /api/streams HTTP/1.1\r\nHost: localhost:8890\r\n\r\n")
        else {
            panic!("head should be complete");
        };
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/api/streams");
        assert_eq!(head.host.as_deref(), Some("localhost:8890"));
        assert!(!head.websocket);
    }

    #[test]
    fn test_parse_request_head_detects_upgrade() {
        let raw = b"GET /ws/duel?s1=a&s2=b HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(matches!(parse_request_head(raw), HeadParse::Complete(h) if h.websocket));
    }

    #[test]
    fn test_parse_request_head_incomplete() {
        assert_eq!(parse_request_head(b"GET / HTTP/1.1\r\nHost: x\r\n"), HeadParse::Partial);
    }

    #[test]
    fn test_parent_host_strips_port() {
        assert_eq!(parent_host(Some("example.org:8890")), "example.org");
        assert_eq!(parent_host(None), "localhost");
    }

    // -- routing --

    #[test]
    fn test_root_serves_lobby() {
        let resp = route_request(&state(), &get("/"));
        assert_eq!(resp.status, 200);
        assert!(resp.body.contains("/api/streams"));
    }

    #[test]
    fn test_duel_page_requires_both_streams() {
        assert_eq!(route_request(&state(), &get("/duel?s1=a&s2=b")).status, 200);
        assert_eq!(route_request(&state(), &get("/duel?s1=a")).status, 400);
    }

    #[test]
    fn test_api_streams_lists_data() {
        let st = state();
        st.service
            .upsert_stream(&Stream {
                id: "a".to_string(),
                title: "Alpha".to_string(),
                platform: "youtube".to_string(),
                url: "https://youtu.be/abc".to_string(),
                is_live: true,
            })
            .unwrap();
        let resp = route_request(&st, &get("/api/streams"));
        assert_eq!(resp.status, 200);
        assert_eq!(body_json(&resp)["data"][0]["title"], "Alpha");
    }

    #[test]
    fn test_api_streams_failure_is_500_with_error() {
        let flaky = FlakyService::new();
        flaky.set_failing(true);
        let resp = route_request(&state_with(flaky), &get("/api/streams"));
        assert_eq!(resp.status, 500);
        assert!(body_json(&resp)["error"].is_string());
    }

    #[test]
    fn test_api_duel_summary() {
        let st = state();
        st.service
            .upsert_stream(&Stream {
                id: "a".to_string(),
                title: "Alpha".to_string(),
                platform: "twitch".to_string(),
                url: "https://twitch.tv/alpha".to_string(),
                is_live: true,
            })
            .unwrap();
        st.service
            .insert_reaction(NewReaction {
                duel_id: "a-b".to_string(),
                side: Side::Left,
                rtype: ReactionKind::Like,
                user_fingerprint: "fp".to_string(),
            })
            .unwrap();
        st.service
            .insert_message(NewMessage {
                duel_id: "a-b".to_string(),
                username: "U1".to_string(),
                content: "hi".to_string(),
            })
            .unwrap();
        let resp = route_request(&st, &get("/api/duel?s1=a&s2=b"));
        assert_eq!(resp.status, 200);
        let json = body_json(&resp);
        assert_eq!(json["duel_id"], "a-b");
        assert_eq!(json["left"]["title"], "Alpha");
        assert_eq!(
            json["left"]["embed_url"],
            "https://player.twitch.tv/?channel=alpha&parent=example.org"
        );
        assert!(json["right"].is_null());
        assert_eq!(json["counts"]["left"]["like"], 1);
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_path_404() {
        assert_eq!(route_request(&state(), &get("/nope")).status, 404);
    }

    #[test]
    fn test_post_rejected() {
        let mut head = get("/api/streams");
        head.method = "POST".to_string();
        assert_eq!(route_request(&state(), &head).status, 405);
    }

    #[test]
    fn test_response_bytes_have_content_length() {
        let resp = HttpResponse::error(404, "not found");
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains(&format!("Content-Length: {}", resp.body.len())));
    }

    #[test]
    fn test_pages_have_no_external_script_deps() {
        for page in [LOBBY_HTML, DUEL_HTML] {
            assert!(!page.contains("unpkg.com"));
            assert!(!page.contains("jsdelivr"));
            assert!(page.contains("width=device-width"));
        }
    }

    // -- server integration smoke test --

    #[tokio::test]
    async fn test_serve_on_answers_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, state()));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /api/streams HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut out = String::new();
        conn.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK"));
        assert!(out.ends_with(r#"{"data":[]}"#));
    }

    async fn spawn_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, state()));
        addr
    }

    async fn first_line(conn: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).lines().next().unwrap_or("").to_string()
    }

    #[test]
    fn test_parse_request_head_malformed_is_invalid() {
        assert!(matches!(parse_request_head(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n"), HeadParse::Invalid(_)));
    }

    #[test]
    fn test_parse_request_head_accepts_many_headers() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..40 {
            raw.push_str(&format!("X-Extra-{}: v\r\n", i));
        }
        raw.push_str("\r\n");
        assert!(matches!(parse_request_head(raw.as_bytes()), HeadParse::Complete(_)));
    }

    #[tokio::test]
    async fn test_upgrade_with_large_cookie_header_is_accepted() {
        let addr = spawn_server().await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let cookie = "c".repeat(2500);
        let req = format!(
            "GET /ws/duel?s1=a&s2=b HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\nCookie: k={}\r\n\r\n",
            cookie
        );
        conn.write_all(req.as_bytes()).await.unwrap();
        assert!(first_line(&mut conn).await.starts_with("HTTP/1.1 101"));
    }

    #[tokio::test]
    async fn test_head_split_across_writes_is_read_whole() {
        let addr = spawn_server().await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /api/streams HTTP/1.1\r\nHo").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        conn.write_all(b"st: localhost\r\n\r\n").await.unwrap();
        assert_eq!(first_line(&mut conn).await, "HTTP/1.1 200 OK");
    }

    #[tokio::test]
    async fn test_malformed_head_gets_400_without_waiting() {
        let addr = spawn_server().await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        // Left open on purpose: the answer must not depend on EOF.
        conn.write_all(b"GET / HTTP/1.1\r\nNo colon here\r\n\r\n").await.unwrap();
        assert_eq!(first_line(&mut conn).await, "HTTP/1.1 400 Bad Request");
    }
}
