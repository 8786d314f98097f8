//! Page scripts injected through `script.callFunction` and
//! `script.addPreloadScript`.
//!
//! Every preload source is idempotent and self-reinstalling: it tolerates
//! being evaluated after user code already ran and being evaluated twice.

/// Predicate used by `find`/`find-all`. Receives the selector spec embedded
/// as JSON and returns the matching elements in document order.
///
/// Semantic keys are conjunctive. `label` means the accessible-name
/// mechanisms (`aria-label`, `aria-labelledby`, an associated `<label>`),
/// never text content.
pub const FINDER_BODY: &str = r#"
  const lower = (s) => (s || '').toLowerCase();
  const textOf = (el) => lower(el.innerText !== undefined ? el.innerText : el.textContent);
  const labelOf = (el) => {
    const aria = el.getAttribute && el.getAttribute('aria-label');
    if (aria) return aria;
    const refs = el.getAttribute && el.getAttribute('aria-labelledby');
    if (refs) {
      const joined = refs.split(/\s+/)
        .map((id) => { const r = document.getElementById(id); return r ? r.textContent : ''; })
        .join(' ').trim();
      if (joined) return joined;
    }
    if (el.labels && el.labels.length) {
      return Array.from(el.labels).map((l) => l.textContent).join(' ').trim();
    }
    return '';
  };
  const implicitRole = (el) => {
    const tag = el.tagName ? el.tagName.toLowerCase() : '';
    switch (tag) {
      case 'a': return el.hasAttribute('href') ? 'link' : '';
      case 'button': return 'button';
      case 'select': return el.multiple || el.size > 1 ? 'listbox' : 'combobox';
      case 'textarea': return 'textbox';
      case 'img': return 'img';
      case 'nav': return 'navigation';
      case 'main': return 'main';
      case 'header': return 'banner';
      case 'footer': return 'contentinfo';
      case 'form': return 'form';
      case 'table': return 'table';
      case 'ul': case 'ol': return 'list';
      case 'li': return 'listitem';
      case 'h1': case 'h2': case 'h3': case 'h4': case 'h5': case 'h6': return 'heading';
      case 'option': return 'option';
      case 'input': {
        const type = lower(el.type);
        if (type === 'checkbox') return 'checkbox';
        if (type === 'radio') return 'radio';
        if (type === 'range') return 'slider';
        if (type === 'button' || type === 'submit' || type === 'reset' || type === 'image') return 'button';
        if (type === 'search') return 'searchbox';
        if (type === 'hidden') return '';
        return 'textbox';
      }
      default: return '';
    }
  };
  const roleOf = (el) => (el.getAttribute && el.getAttribute('role')) || implicitRole(el);

  let candidates = null;
  const restrict = (list) => {
    candidates = candidates === null ? list : candidates.filter((el) => list.indexOf(el) !== -1);
  };
  const filter = (pred) => {
    candidates = (candidates === null
      ? Array.from(document.querySelectorAll('*'))
      : candidates).filter(pred);
  };

  if (spec.css) restrict(Array.from(document.querySelectorAll(spec.css)));
  if (spec.xpath) {
    const out = [];
    const it = document.evaluate(spec.xpath, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
    for (let i = 0; i < it.snapshotLength; i++) out.push(it.snapshotItem(i));
    restrict(out);
  }
  if (spec.role) filter((el) => roleOf(el) === spec.role);
  if (spec.testid) filter((el) => el.getAttribute && el.getAttribute('data-testid') === spec.testid);
  if (spec.text) filter((el) => textOf(el).includes(lower(spec.text)));
  if (spec.label) filter((el) => lower(labelOf(el)).includes(lower(spec.label)));
  if (spec.placeholder) filter((el) => lower(el.getAttribute && el.getAttribute('placeholder')).includes(lower(spec.placeholder)));
  if (spec.alt) filter((el) => lower(el.getAttribute && el.getAttribute('alt')).includes(lower(spec.alt)));
  if (spec.title) filter((el) => lower(el.getAttribute && el.getAttribute('title')).includes(lower(spec.title)));
  if (spec.near) {
    const anchor = document.querySelector(spec.near);
    if (!anchor) return [];
    const a = anchor.getBoundingClientRect();
    const center = { x: a.x + a.width / 2, y: a.y + a.height / 2 };
    filter((el) => {
      if (el === anchor) return false;
      const r = el.getBoundingClientRect();
      const dx = Math.max(r.x - center.x, center.x - (r.x + r.width), 0);
      const dy = Math.max(r.y - center.y, center.y - (r.y + r.height), 0);
      return Math.hypot(dx, dy) <= 200;
    });
  }

  if (candidates === null) return [];
  // keep only connected elements, innermost matches first for text-y specs
  candidates = candidates.filter((el) => el.isConnected && el.nodeType === 1);
  if (!spec.css && !spec.xpath && spec.text) {
    candidates = candidates.filter((el) => !candidates.some((other) => other !== el && el.contains(other)));
  }
  return candidates.slice(0, 256);
"#;

/// Build the find predicate with the selector spec embedded.
pub fn finder_source(spec: &serde_json::Value) -> String {
    format!("() => {{ const spec = {spec};\n{FINDER_BODY}\n}}")
}

/// Summarize one element for the `find` result payload.
pub const DESCRIBE_ELEMENT: &str = r#"(el) => {
  const r = el.getBoundingClientRect();
  const text = (el.innerText !== undefined ? el.innerText : el.textContent) || '';
  return {
    tag: el.tagName ? el.tagName.toLowerCase() : '',
    text: text.trim().replace(/\s+/g, ' ').slice(0, 80),
    box: { x: r.x, y: r.y, width: r.width, height: r.height },
  };
}"#;

/// Actionability probe run before input verbs.
pub const ACTIONABILITY_PROBE: &str = r#"(el) => {
  const attached = !!el.isConnected;
  let rect = { x: 0, y: 0, width: 0, height: 0 };
  let visible = false;
  if (attached && el.getBoundingClientRect) {
    const r = el.getBoundingClientRect();
    rect = { x: r.x, y: r.y, width: r.width, height: r.height };
    const style = window.getComputedStyle(el);
    visible = r.width > 0 && r.height > 0 &&
      style.visibility !== 'hidden' && style.display !== 'none' && style.opacity !== '0';
  }
  const disabled = !!(el.disabled || (el.getAttribute && el.getAttribute('aria-disabled') === 'true'));
  const tag = el.tagName ? el.tagName.toLowerCase() : '';
  const nonText = ['checkbox', 'radio', 'button', 'submit', 'reset', 'file', 'image', 'range', 'color', 'hidden'];
  const editable = (tag === 'input' && nonText.indexOf((el.type || '').toLowerCase()) === -1)
    || tag === 'textarea' || el.isContentEditable === true;
  return { attached, visible, disabled, editable, rect };
}"#;

pub const OUTER_HTML: &str =
    "() => document.documentElement ? document.documentElement.outerHTML : ''";

pub const SET_CONTENT: &str =
    "(html) => { document.open(); document.write(html); document.close(); }";

/// Mirrors WebSocket traffic of the page into `__vibium_ws_frames__` so the
/// trace recorder can pick it up.
pub const WEBSOCKET_MIRROR: &str = r#"() => {
  const g = globalThis;
  if (g.__vibium_ws_mirror__) return;
  g.__vibium_ws_mirror__ = true;
  g.__vibium_ws_frames__ = [];
  const frames = g.__vibium_ws_frames__;
  const push = (entry) => { frames.push(entry); if (frames.length > 1000) frames.shift(); };
  const Original = g.WebSocket;
  if (!Original) return;
  g.WebSocket = new Proxy(Original, {
    construct(target, args) {
      const ws = new target(...args);
      try {
        ws.addEventListener('message', (e) => {
          push({ dir: 'recv', url: ws.url, data: String(e.data).slice(0, 4096), ts: Date.now() });
        });
        const send = ws.send.bind(ws);
        ws.send = (data) => {
          push({ dir: 'sent', url: ws.url, data: String(data).slice(0, 4096), ts: Date.now() });
          return send(data);
        };
      } catch (err) { /* mirroring must never break the page */ }
      return ws;
    },
  });
}"#;

/// Accessibility tree walker. `everything:false` hides nodes whose role is
/// "generic" and whose name and value are empty, hoisting their children.
pub const A11Y_TREE: &str = r#"(rootSel, everything) => {
  const lower = (s) => (s || '').toLowerCase();
  const implicitRole = (el) => {
    const tag = el.tagName ? el.tagName.toLowerCase() : '';
    switch (tag) {
      case 'a': return el.hasAttribute('href') ? 'link' : 'generic';
      case 'button': return 'button';
      case 'select': return el.multiple || el.size > 1 ? 'listbox' : 'combobox';
      case 'textarea': return 'textbox';
      case 'img': return 'img';
      case 'nav': return 'navigation';
      case 'main': return 'main';
      case 'header': return 'banner';
      case 'footer': return 'contentinfo';
      case 'form': return 'form';
      case 'table': return 'table';
      case 'ul': case 'ol': return 'list';
      case 'li': return 'listitem';
      case 'h1': case 'h2': case 'h3': case 'h4': case 'h5': case 'h6': return 'heading';
      case 'option': return 'option';
      case 'p': return 'paragraph';
      case 'input': {
        const type = lower(el.type);
        if (type === 'checkbox') return 'checkbox';
        if (type === 'radio') return 'radio';
        if (type === 'range') return 'slider';
        if (type === 'button' || type === 'submit' || type === 'reset' || type === 'image') return 'button';
        if (type === 'search') return 'searchbox';
        return 'textbox';
      }
      default: return 'generic';
    }
  };
  const nameOf = (el) => {
    const aria = el.getAttribute('aria-label');
    if (aria) return aria.trim();
    const refs = el.getAttribute('aria-labelledby');
    if (refs) {
      const joined = refs.split(/\s+/)
        .map((id) => { const r = document.getElementById(id); return r ? r.textContent : ''; })
        .join(' ').trim();
      if (joined) return joined;
    }
    if (el.labels && el.labels.length) {
      return Array.from(el.labels).map((l) => l.textContent).join(' ').trim();
    }
    const alt = el.getAttribute('alt');
    if (alt) return alt.trim();
    const title = el.getAttribute('title');
    if (title) return title.trim();
    if (!el.children.length) {
      return (el.textContent || '').trim().replace(/\s+/g, ' ').slice(0, 120);
    }
    const tag = el.tagName.toLowerCase();
    if (tag === 'a' || tag === 'button' || /^h[1-6]$/.test(tag)) {
      return (el.textContent || '').trim().replace(/\s+/g, ' ').slice(0, 120);
    }
    return '';
  };
  const valueOf = (el) => {
    if (el.tagName === 'INPUT' || el.tagName === 'TEXTAREA' || el.tagName === 'SELECT') {
      return String(el.value || '');
    }
    return '';
  };
  const hiddenOf = (el) => {
    if (el.getAttribute('aria-hidden') === 'true') return true;
    const style = window.getComputedStyle(el);
    return style.display === 'none' || style.visibility === 'hidden';
  };
  const walk = (el) => {
    if (el.nodeType !== 1 || hiddenOf(el)) return [];
    const role = el.getAttribute('role') || implicitRole(el);
    const name = nameOf(el);
    const value = valueOf(el);
    const children = Array.from(el.children).flatMap(walk);
    if (!everything && role === 'generic' && !name && !value) {
      // transparent wrapper: hoist its children
      return children;
    }
    const node = { role, name };
    if (value) node.value = value;
    if (children.length) node.children = children;
    return [node];
  };
  const root = rootSel ? document.querySelector(rootSel) : document.body;
  if (!root) return null;
  const nodes = walk(root);
  return nodes.length === 1 ? nodes[0] : { role: 'generic', name: '', children: nodes };
}"#;

/// Body of the clock shim. The install config is embedded by
/// [`clock_shim_source`]; the shim keeps its whole state on
/// `globalThis.__vibium_clock__` and is a no-op when already present.
const CLOCK_SHIM_BODY: &str = r#"
  const g = globalThis;
  if (g.__vibium_clock__) {
    if (cfg.tz !== undefined) g.__vibium_clock__.state.tz = cfg.tz;
    return;
  }
  const OriginalDate = Date;
  const origSetTimeout = g.setTimeout.bind(g);
  const origClearTimeout = g.clearTimeout.bind(g);
  const origSetInterval = g.setInterval.bind(g);
  const origClearInterval = g.clearInterval.bind(g);
  const origPerfNow = performance.now.bind(performance);

  const state = {
    base: cfg.time !== undefined && cfg.time !== null ? cfg.time : OriginalDate.now(),
    mode: 'paused',
    anchor: 0,
    tz: cfg.tz !== undefined ? cfg.tz : null,
    nextId: 1,
    timers: new Map(),
    perfAnchor: origPerfNow(),
    virtualStart: 0,
  };
  state.virtualStart = state.base;

  const api = {
    state,
    now() {
      if (state.mode === 'running') return state.base + (OriginalDate.now() - state.anchor);
      return state.base;
    },
    schedule(cb, delay, interval, args) {
      const id = state.nextId++;
      const due = api.now() + Math.max(0, Number(delay) || 0);
      const timer = { cb, due, interval, args, real: null };
      state.timers.set(id, timer);
      if (state.mode === 'running') api.arm(id, timer);
      return id;
    },
    arm(id, timer) {
      const remaining = Math.max(0, timer.due - api.now());
      timer.real = origSetTimeout(() => api.fire(id), remaining);
    },
    disarm(timer) {
      if (timer.real !== null) { origClearTimeout(timer.real); timer.real = null; }
    },
    fire(id) {
      const timer = state.timers.get(id);
      if (!timer) return;
      if (timer.interval !== null) {
        timer.due = timer.due + timer.interval;
        if (state.mode === 'running') api.arm(id, timer);
      } else {
        state.timers.delete(id);
      }
      timer.cb.apply(g, timer.args);
    },
    clear(id) {
      const timer = state.timers.get(Number(id));
      if (timer) { api.disarm(timer); state.timers.delete(Number(id)); }
    },
    dueBefore(target) {
      let best = null;
      for (const [id, timer] of state.timers) {
        if (timer.due <= target && (best === null || timer.due < best.timer.due)) {
          best = { id, timer };
        }
      }
      return best;
    },
    fastForward(ms) {
      const target = api.now() + ms;
      const due = [];
      for (const [id, timer] of state.timers) {
        if (timer.due <= target) due.push({ id, timer });
      }
      due.sort((a, b) => a.timer.due - b.timer.due);
      state.base = target;
      state.anchor = OriginalDate.now();
      for (const { id } of due) api.fire(id);
    },
    runFor(ms) {
      const target = api.now() + ms;
      for (;;) {
        const next = api.dueBefore(target);
        if (!next) break;
        state.base = next.timer.due;
        api.fire(next.id);
      }
      state.base = target;
      state.anchor = OriginalDate.now();
    },
    pauseAt(t) {
      for (const timer of state.timers.values()) api.disarm(timer);
      state.mode = 'paused';
      state.base = t;
    },
    resume() {
      state.mode = 'running';
      state.anchor = OriginalDate.now();
      for (const [id, timer] of state.timers) api.arm(id, timer);
    },
    setFixedTime(t) {
      for (const timer of state.timers.values()) api.disarm(timer);
      state.mode = 'fixed';
      state.base = t;
    },
    setSystemTime(t) {
      state.base = t;
      state.anchor = OriginalDate.now();
    },
    setTimezone(tz) {
      state.tz = tz;
    },
  };

  class VibiumDate extends OriginalDate {
    constructor(...args) {
      if (args.length === 0) { super(api.now()); } else { super(...args); }
    }
    static now() { return api.now(); }
  }
  g.Date = VibiumDate;
  g.setTimeout = (cb, delay, ...args) => {
    if (typeof cb !== 'function') { const src = String(cb); cb = () => (0, eval)(src); }
    return api.schedule(cb, delay, null, args);
  };
  g.clearTimeout = (id) => api.clear(id);
  g.setInterval = (cb, delay, ...args) => {
    if (typeof cb !== 'function') { const src = String(cb); cb = () => (0, eval)(src); }
    return api.schedule(cb, delay, Math.max(1, Number(delay) || 1), args);
  };
  g.clearInterval = (id) => api.clear(id);
  performance.now = () => state.perfAnchor + (api.now() - state.virtualStart);

  const origResolved = Intl.DateTimeFormat.prototype.resolvedOptions;
  Intl.DateTimeFormat.prototype.resolvedOptions = function resolvedOptions() {
    const options = origResolved.call(this);
    if (state.tz) options.timeZone = state.tz;
    return options;
  };

  g.__vibium_clock__ = api;
"#;

/// Build the clock shim preload with the install config embedded.
///
/// `config` carries `time` (epoch ms) and `tz` (IANA name), both optional.
pub fn clock_shim_source(config: &serde_json::Value) -> String {
    format!("() => {{ const cfg = {config};\n{CLOCK_SHIM_BODY}\n}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finder_embeds_the_spec() {
        let src = finder_source(&serde_json::json!({"css": "a", "text": "More"}));
        assert!(src.starts_with("() => {"));
        assert!(src.contains(r#""css":"a""#));
        assert!(src.contains("spec.near"));
    }

    #[test]
    fn clock_shim_embeds_config_and_stays_idempotent() {
        let src = clock_shim_source(&serde_json::json!({"time": 1735689600000u64}));
        assert!(src.contains("1735689600000"));
        assert!(src.contains("if (g.__vibium_clock__)"));
    }

    #[test]
    fn scripts_are_function_declarations() {
        for src in [
            DESCRIBE_ELEMENT,
            ACTIONABILITY_PROBE,
            OUTER_HTML,
            SET_CONTENT,
            WEBSOCKET_MIRROR,
            A11Y_TREE,
        ] {
            assert!(src.trim_start().starts_with('(') || src.trim_start().starts_with("()"));
        }
    }
}
